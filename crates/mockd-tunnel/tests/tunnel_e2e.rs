//! End-to-end tunnel tests against an in-process relay stub.
//!
//! The stub is a real QUIC server speaking the relay wire protocol: it
//! accepts the agent's control stream, answers the auth handshake, and then
//! opens streams at the agent the way the production relay would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use mockd_tunnel::{
    ClientConfig, HandlerError, HttpHandler, ManagerOptions, RequestBody, ResponseBody,
    TunnelClient, TunnelConfig, TunnelError, TunnelManager, TunnelStatus,
};
use mockd_wire::{
    decode_header, encode_header, read_chunk, AuthOk, AuthRequest, ControlMessage, Goaway,
    HttpMetadata, MqttMetadata, ProtocolPort, StreamFlags, StreamHeader, StreamType,
};
use quinn::crypto::rustls::QuicServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ── Relay stub ──────────────────────────────────────────────────────────────

struct RelayStub {
    endpoint: quinn::Endpoint,
}

struct AgentSession {
    conn: quinn::Connection,
    control_send: quinn::SendStream,
    #[allow(dead_code)]
    control_recv: quinn::RecvStream,
    auth: AuthRequest,
}

impl RelayStub {
    fn bind() -> anyhow::Result<(Self, String)> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)?;
        server_crypto.alpn_protocols = vec![b"mockd-relay".to_vec()];

        let server_config =
            quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(server_crypto)?));
        let endpoint = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse()?)?;
        let addr = format!("127.0.0.1:{}", endpoint.local_addr()?.port());
        Ok((Self { endpoint }, addr))
    }

    /// Accept one agent, read its auth message, answer with `reply`.
    async fn accept_agent(&self, reply: ControlMessage) -> anyhow::Result<AgentSession> {
        let incoming = self.endpoint.accept().await.context("no incoming connection")?;
        let conn = incoming.await?;
        let (mut control_send, mut control_recv) = conn.accept_bi().await?;

        let header = decode_header(&mut control_recv).await?;
        let auth = match ControlMessage::from_metadata(&header.metadata)? {
            ControlMessage::Auth(auth) => auth,
            other => anyhow::bail!("expected auth, got {other:?}"),
        };
        encode_header(&mut control_send, &reply.to_header()?).await?;

        Ok(AgentSession {
            conn,
            control_send,
            control_recv,
            auth,
        })
    }

    /// Accept one agent but answer with a hand-crafted raw reply header.
    async fn accept_agent_raw(&self, reply: StreamHeader) -> anyhow::Result<AgentSession> {
        let incoming = self.endpoint.accept().await.context("no incoming connection")?;
        let conn = incoming.await?;
        let (mut control_send, mut control_recv) = conn.accept_bi().await?;
        let header = decode_header(&mut control_recv).await?;
        let auth = match ControlMessage::from_metadata(&header.metadata)? {
            ControlMessage::Auth(auth) => auth,
            other => anyhow::bail!("expected auth, got {other:?}"),
        };
        encode_header(&mut control_send, &reply).await?;
        Ok(AgentSession {
            conn,
            control_send,
            control_recv,
            auth,
        })
    }
}

fn auth_ok(session_id: &str) -> ControlMessage {
    ControlMessage::AuthOk(AuthOk {
        session_id: session_id.to_string(),
        subdomain: "abc".to_string(),
        public_url: "https://abc.example".to_string(),
    })
}

// ── Handlers ────────────────────────────────────────────────────────────────

/// Echoes the request body with a 200.
struct EchoHandler;

#[async_trait]
impl HttpHandler for EchoHandler {
    async fn serve(
        &self,
        req: http::Request<RequestBody>,
    ) -> Result<http::Response<ResponseBody>, HandlerError> {
        let body = req.into_body().bytes().await?;
        Ok(http::Response::builder()
            .status(200)
            .header("X-Echo-Len", body.len().to_string())
            .body(ResponseBody::from(body.to_vec()))?)
    }
}

/// Serves fixed content for the ping scenario.
struct PongHandler;

#[async_trait]
impl HttpHandler for PongHandler {
    async fn serve(
        &self,
        req: http::Request<RequestBody>,
    ) -> Result<http::Response<ResponseBody>, HandlerError> {
        assert_eq!(req.uri().path(), "/ping");
        Ok(http::Response::builder()
            .status(200)
            .body(ResponseBody::from("pong"))?)
    }
}

fn test_client(
    relay_addr: &str,
    handler: Arc<dyn HttpHandler>,
    local_port: u16,
    protocols: Vec<ProtocolPort>,
) -> Arc<TunnelClient> {
    Arc::new(TunnelClient::new(
        ClientConfig {
            relay_addr: relay_addr.to_string(),
            token: "test-token".to_string(),
            local_port,
            protocols,
            tunnel_auth: None,
            insecure: true,
        },
        handler,
        Arc::new(mockd_tunnel::TunnelStats::new()),
    ))
}

fn spawn_run(client: &Arc<TunnelClient>, cancel: &CancellationToken) {
    let client = Arc::clone(client);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = client.run(&cancel).await;
    });
}

/// The counter ticks after the agent closes the stream, so observe it with
/// a small grace period instead of racing the agent task.
async fn wait_for_requests(client: &Arc<TunnelClient>, n: u64) {
    for _ in 0..500 {
        if client.requests_served() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request counter never reached {n} (at {})", client.requests_served());
}

// ── Handshake scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn successful_connect_exposes_session() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(auth_ok("s1")).await });

    let mut raw_client = TunnelClient::new(
        ClientConfig {
            relay_addr: addr,
            token: "t".to_string(),
            local_port: 4280,
            protocols: vec![ProtocolPort {
                proto: "http".to_string(),
                port: 4280,
                name: None,
            }],
            tunnel_auth: None,
            insecure: true,
        },
        Arc::new(EchoHandler),
        Arc::new(mockd_tunnel::TunnelStats::new()),
    );
    let connects = Arc::new(AtomicUsize::new(0));
    let seen_url = Arc::new(std::sync::Mutex::new(String::new()));
    {
        let connects = Arc::clone(&connects);
        let seen_url = Arc::clone(&seen_url);
        raw_client.set_on_connect(move |url| {
            connects.fetch_add(1, Ordering::SeqCst);
            *seen_url.lock().unwrap() = url.to_string();
        });
    }
    let client = Arc::new(raw_client);

    let cancel = CancellationToken::new();
    Arc::clone(&client).connect(&cancel).await?;

    assert!(client.is_connected());
    assert_eq!(client.public_url().as_deref(), Some("https://abc.example"));
    assert_eq!(client.session_id().as_deref(), Some("s1"));
    assert_eq!(client.subdomain().as_deref(), Some("abc"));
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(seen_url.lock().unwrap().as_str(), "https://abc.example");

    // The relay observed the announced port table.
    let session = relay.await??;
    assert_eq!(session.auth.token, "t");
    assert_eq!(session.auth.local_port, 4280);
    assert_eq!(session.auth.protocols.len(), 1);

    client.close();
    Ok(())
}

#[tokio::test]
async fn auth_failure_carries_code_and_message() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move {
        stub.accept_agent(ControlMessage::AuthError(mockd_wire::AuthError {
            code: "bad_token".to_string(),
            message: "invalid".to_string(),
        }))
        .await
    });

    let mut raw_client = TunnelClient::new(
        ClientConfig {
            relay_addr: addr,
            token: "nope".to_string(),
            local_port: 4280,
            protocols: vec![],
            tunnel_auth: None,
            insecure: true,
        },
        Arc::new(EchoHandler),
        Arc::new(mockd_tunnel::TunnelStats::new()),
    );
    let connects = Arc::new(AtomicUsize::new(0));
    {
        let connects = Arc::clone(&connects);
        raw_client.set_on_connect(move |_| {
            connects.fetch_add(1, Ordering::SeqCst);
        });
    }
    let client = Arc::new(raw_client);

    let cancel = CancellationToken::new();
    let err = Arc::clone(&client).connect(&cancel).await.unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("bad_token"), "got: {rendered}");
    assert!(rendered.contains("invalid"), "got: {rendered}");
    assert!(!client.is_connected());
    assert_eq!(connects.load(Ordering::SeqCst), 0);

    relay.await??;
    Ok(())
}

#[tokio::test]
async fn handshake_rejects_unknown_version() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let mut reply = auth_ok("s1").to_header()?;
    reply.version = 255;
    let relay = tokio::spawn(async move { stub.accept_agent_raw(reply).await });

    let client = test_client(&addr, Arc::new(EchoHandler), 4280, vec![]);
    let cancel = CancellationToken::new();
    let err = Arc::clone(&client).connect(&cancel).await.unwrap_err();
    assert!(matches!(err, TunnelError::BadVersion(255)));
    assert!(!client.is_connected());

    relay.await??;
    Ok(())
}

#[tokio::test]
async fn handshake_rejects_unexpected_reply() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(ControlMessage::Ping).await });

    let client = test_client(&addr, Arc::new(EchoHandler), 4280, vec![]);
    let cancel = CancellationToken::new();
    let err = Arc::clone(&client).connect(&cancel).await.unwrap_err();
    assert!(matches!(err, TunnelError::UnexpectedControl));

    relay.await??;
    Ok(())
}

// ── Half-duplex HTTP ────────────────────────────────────────────────────────

async fn http_round_trip(
    conn: &quinn::Connection,
    meta: &HttpMetadata,
    body: &[u8],
) -> anyhow::Result<(HttpMetadata, Vec<u8>)> {
    let (mut send, mut recv) = conn.open_bi().await?;
    let header = StreamHeader::with_json(StreamType::Http, StreamFlags::empty(), meta)?;
    encode_header(&mut send, &header).await?;
    send.write_all(body).await?;
    send.finish()?;

    let resp_header = decode_header(&mut recv).await?;
    anyhow::ensure!(resp_header.stream_type == StreamType::Http);
    let resp_meta: HttpMetadata = resp_header.metadata_json()?;
    let resp_body = recv.read_to_end(16 * 1024 * 1024).await?;
    Ok((resp_meta, resp_body))
}

#[tokio::test]
async fn half_duplex_http_serves_local_handler() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(auth_ok("s1")).await });

    let client = test_client(&addr, Arc::new(PongHandler), 4280, vec![]);
    let cancel = CancellationToken::new();
    Arc::clone(&client).connect(&cancel).await?;
    spawn_run(&client, &cancel);
    let session = relay.await??;

    let meta = HttpMetadata {
        method: "GET".to_string(),
        path: "/ping".to_string(),
        host: "abc.example".to_string(),
        ..Default::default()
    };
    let (resp_meta, body) = http_round_trip(&session.conn, &meta, b"").await?;
    assert_eq!(resp_meta.status_code, 200);
    assert_eq!(body, b"pong");
    wait_for_requests(&client, 1).await;

    client.close();
    Ok(())
}

#[tokio::test]
async fn http_echo_round_trips_bodies_of_all_sizes() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(auth_ok("s1")).await });

    let client = test_client(&addr, Arc::new(EchoHandler), 4280, vec![]);
    let cancel = CancellationToken::new();
    Arc::clone(&client).connect(&cancel).await?;
    spawn_run(&client, &cancel);
    let session = relay.await??;

    for (i, size) in [0usize, 1, 4 * 1024, 64 * 1024, 4 * 1024 * 1024 - 1]
        .into_iter()
        .enumerate()
    {
        let body: Vec<u8> = (0..size).map(|b| (b % 251) as u8).collect();
        let mut meta = HttpMetadata {
            method: "POST".to_string(),
            path: "/echo".to_string(),
            host: "abc.example".to_string(),
            ..Default::default()
        };
        meta.add_header("Content-Length", size.to_string());

        let (resp_meta, resp_body) = http_round_trip(&session.conn, &meta, &body).await?;
        assert_eq!(resp_meta.status_code, 200, "size {size}");
        assert_eq!(resp_body, body, "size {size}");
        assert_eq!(
            resp_meta.first_header("x-echo-len"),
            Some(size.to_string().as_str())
        );
        wait_for_requests(&client, (i + 1) as u64).await;
    }

    client.close();
    Ok(())
}

#[tokio::test]
async fn malformed_http_metadata_yields_400() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(auth_ok("s1")).await });

    let client = test_client(&addr, Arc::new(EchoHandler), 4280, vec![]);
    let cancel = CancellationToken::new();
    Arc::clone(&client).connect(&cancel).await?;
    spawn_run(&client, &cancel);
    let session = relay.await??;

    let (mut send, mut recv) = session.conn.open_bi().await?;
    let broken = StreamHeader::new(
        StreamType::Http,
        StreamFlags::empty(),
        Bytes::from_static(b"this is not json"),
    );
    encode_header(&mut send, &broken).await?;
    send.finish()?;

    let resp_header = decode_header(&mut recv).await?;
    let resp_meta: HttpMetadata = resp_header.metadata_json()?;
    assert_eq!(resp_meta.status_code, 400);
    assert_eq!(resp_meta.first_header("content-type"), Some("text/plain"));

    client.close();
    Ok(())
}

// ── WebSocket bridge ────────────────────────────────────────────────────────

#[derive(Debug)]
enum LocalEvent {
    Request(String),
    Payload(Vec<u8>),
    Eof(bool),
}

#[tokio::test]
async fn websocket_bridge_with_half_close() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(auth_ok("s1")).await });

    // Local service: answer the upgrade, push 3 bytes, read 3 bytes, then
    // wait for the half-close EOF.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_port = listener.local_addr()?.port();
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            let n = socket.read(&mut tmp).await.unwrap();
            head.extend_from_slice(&tmp[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        events_tx
            .send(LocalEvent::Request(String::from_utf8_lossy(&head).into_owned()))
            .unwrap();

        socket
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();
        socket.write_all(b"abc").await.unwrap();

        let mut payload = [0u8; 3];
        socket.read_exact(&mut payload).await.unwrap();
        events_tx.send(LocalEvent::Payload(payload.to_vec())).unwrap();

        let n = socket.read(&mut tmp).await.unwrap();
        events_tx.send(LocalEvent::Eof(n == 0)).unwrap();
    });

    let client = test_client(&addr, Arc::new(EchoHandler), local_port, vec![]);
    let cancel = CancellationToken::new();
    Arc::clone(&client).connect(&cancel).await?;
    spawn_run(&client, &cancel);
    let session = relay.await??;

    let (mut send, mut recv) = session.conn.open_bi().await?;
    let mut meta = HttpMetadata {
        method: "GET".to_string(),
        path: "/ws".to_string(),
        host: "abc.example".to_string(),
        ..Default::default()
    };
    meta.add_header("Upgrade", "websocket");
    meta.add_header("Connection", "Upgrade");
    meta.add_header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
    let header = StreamHeader::with_json(StreamType::Websocket, StreamFlags::BIDIRECTIONAL, &meta)?;
    encode_header(&mut send, &header).await?;

    let resp_header = decode_header(&mut recv).await?;
    assert_eq!(resp_header.stream_type, StreamType::Websocket);
    assert!(resp_header.flags.contains(StreamFlags::BIDIRECTIONAL));
    let resp_meta: HttpMetadata = resp_header.metadata_json()?;
    assert_eq!(resp_meta.status_code, 101);
    assert_eq!(resp_meta.first_header("upgrade"), Some("websocket"));

    match events_rx.recv().await.unwrap() {
        LocalEvent::Request(head) => {
            assert!(head.starts_with("GET /ws HTTP/1.1\r\n"), "got: {head}");
            assert!(head.contains("Upgrade: websocket"));
            assert!(head.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ=="));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // local → relay payload (rides partly as head-parser carry-over)
    let mut payload = [0u8; 3];
    recv.read_exact(&mut payload).await?;
    assert_eq!(&payload, b"abc");

    // relay → local payload
    send.write_all(b"xyz").await?;
    match events_rx.recv().await.unwrap() {
        LocalEvent::Payload(p) => assert_eq!(p, b"xyz"),
        other => panic!("unexpected event: {other:?}"),
    }

    // closing the relay side half-closes the local TCP write direction
    send.finish()?;
    match events_rx.recv().await.unwrap() {
        LocalEvent::Eof(saw_eof) => assert!(saw_eof),
        other => panic!("unexpected event: {other:?}"),
    }

    client.close();
    Ok(())
}

// ── gRPC via h2c ────────────────────────────────────────────────────────────

#[tokio::test]
async fn grpc_forwarding_preserves_trailer_framing() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(auth_ok("s1")).await });

    // Local h2c service: 200 + two data frames + grpc-status trailer.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut conn = h2::server::handshake(socket).await.unwrap();
        while let Some(accepted) = conn.accept().await {
            let (request, mut respond) = accepted.unwrap();
            tokio::spawn(async move {
                assert_eq!(request.uri().path(), "/pkg.Service/Method");
                let response = http::Response::builder()
                    .status(200)
                    .header("content-type", "application/grpc")
                    .body(())
                    .unwrap();
                let mut send = respond.send_response(response, false).unwrap();
                send.send_data(Bytes::from_static(b"chunk-a"), false).unwrap();
                send.send_data(Bytes::from_static(b"chunk-b"), false).unwrap();
                let mut trailers = http::HeaderMap::new();
                trailers.insert("grpc-status", "0".parse().unwrap());
                send.send_trailers(trailers).unwrap();

                let mut body = request.into_body();
                while let Some(chunk) = body.data().await {
                    let _ = chunk;
                }
            });
        }
    });

    let client = test_client(&addr, Arc::new(EchoHandler), local_port, vec![]);
    let cancel = CancellationToken::new();
    Arc::clone(&client).connect(&cancel).await?;
    spawn_run(&client, &cancel);
    let session = relay.await??;

    let (mut send, mut recv) = session.conn.open_bi().await?;
    let mut meta = HttpMetadata {
        method: "POST".to_string(),
        path: "/pkg.Service/Method".to_string(),
        host: "abc.example".to_string(),
        ..Default::default()
    };
    meta.add_header("content-type", "application/grpc");
    meta.add_header("te", "trailers");
    let header = StreamHeader::with_json(StreamType::Grpc, StreamFlags::BIDIRECTIONAL, &meta)?;
    encode_header(&mut send, &header).await?;
    send.finish()?; // empty request body

    // Response header first
    let resp_header = decode_header(&mut recv).await?;
    assert_eq!(resp_header.stream_type, StreamType::Grpc);
    assert!(resp_header.flags.contains(StreamFlags::BIDIRECTIONAL));
    let resp_meta: HttpMetadata = resp_header.metadata_json()?;
    assert_eq!(resp_meta.status_code, 200);
    assert_eq!(
        resp_meta.first_header("content-type"),
        Some("application/grpc")
    );

    // Body chunks until the sentinel
    let mut chunks = Vec::new();
    loop {
        let chunk = read_chunk(&mut recv).await?;
        if chunk.is_empty() {
            break;
        }
        chunks.extend_from_slice(&chunk);
    }
    assert_eq!(chunks, b"chunk-achunk-b");

    // Trailer header last
    let trailer_header = decode_header(&mut recv).await?;
    assert!(trailer_header.flags.contains(StreamFlags::TRAILER));
    let trailer_meta: HttpMetadata = trailer_header.metadata_json()?;
    assert_eq!(
        trailer_meta.trailer.get("grpc-status").map(|v| v.as_slice()),
        Some(["0".to_string()].as_slice())
    );

    wait_for_requests(&client, 1).await;
    client.close();
    Ok(())
}

// ── MQTT passthrough ────────────────────────────────────────────────────────

#[tokio::test]
async fn mqtt_passthrough_bridges_named_broker() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;
    let relay = tokio::spawn(async move { stub.accept_agent(auth_ok("s1")).await });

    // Local "broker": echo everything until EOF.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let broker_port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let client = test_client(
        &addr,
        Arc::new(EchoHandler),
        4280,
        vec![ProtocolPort {
            proto: "mqtt".to_string(),
            port: broker_port,
            name: Some("sensors".to_string()),
        }],
    );
    let cancel = CancellationToken::new();
    Arc::clone(&client).connect(&cancel).await?;
    spawn_run(&client, &cancel);
    let session = relay.await??;

    let (mut send, mut recv) = session.conn.open_bi().await?;
    let meta = MqttMetadata {
        broker_name: "sensors".to_string(),
        client_id: "dev-1".to_string(),
    };
    let header = StreamHeader::with_json(StreamType::Mqtt, StreamFlags::BIDIRECTIONAL, &meta)?;
    encode_header(&mut send, &header).await?;

    // Bare confirmation header before any bytes flow.
    let confirm = decode_header(&mut recv).await?;
    assert_eq!(confirm.stream_type, StreamType::Mqtt);
    assert!(confirm.flags.contains(StreamFlags::BIDIRECTIONAL));
    assert!(confirm.metadata.is_empty());

    send.write_all(b"\x10\x0c\x00\x04MQTT").await?;
    let mut echoed = [0u8; 8];
    recv.read_exact(&mut echoed).await?;
    assert_eq!(&echoed, b"\x10\x0c\x00\x04MQTT");

    send.finish()?;
    client.close();
    Ok(())
}

// ── GOAWAY-driven reconnect ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn goaway_drives_manager_reconnect() -> anyhow::Result<()> {
    let (stub, addr) = RelayStub::bind()?;

    let (status_tx, status_rx) = std::sync::mpsc::channel();
    let manager = TunnelManager::new(
        Arc::new(EchoHandler),
        ManagerOptions {
            relay_addr: addr.clone(),
            insecure: true,
            on_status_change: Some(Box::new(move |status, _, _, _| {
                let _ = status_tx.send(status);
            })),
        },
    );

    // The relay serves a first session, drains it with a goaway, then
    // accepts the reconnect.
    let relay = tokio::spawn(async move {
        let mut first = stub.accept_agent(auth_ok("s1")).await?;
        let goaway = ControlMessage::Goaway(Goaway {
            reason: "deploy".to_string(),
            drain_timeout_ms: 1000,
            message: None,
        });
        encode_header(&mut first.control_send, &goaway.to_header()?).await?;
        let second = stub.accept_agent(auth_ok("s2")).await?;
        anyhow::Ok((first, second))
    });

    manager.enable(Some(TunnelConfig {
        enabled: true,
        token: "t".to_string(),
        local_port: 4280,
        ..Default::default()
    }));

    let mut transitions = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    while transitions
        .iter()
        .filter(|s| **s == TunnelStatus::Connected)
        .count()
        < 2
    {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .context("timed out waiting for reconnect")?;
        let status = tokio::task::block_in_place(|| status_rx.recv_timeout(remaining))?;
        transitions.push(status);
    }

    assert_eq!(
        transitions,
        vec![
            TunnelStatus::Connecting,
            TunnelStatus::Connected,
            TunnelStatus::Connecting,
            TunnelStatus::Connected,
        ]
    );
    assert_eq!(manager.stats().reconnects, 1);

    let (_first, second) = relay.await??;
    let (status, public_url, session_id, transport) = manager.status();
    assert_eq!(status, TunnelStatus::Connected);
    assert_eq!(public_url.as_deref(), Some("https://abc.example"));
    assert_eq!(session_id.as_deref(), Some("s2"));
    assert_eq!(transport, "quic");
    assert_eq!(second.auth.token, "t");

    manager.disable();
    Ok(())
}
