//! QUIC tunnel client.
//!
//! A client is single-use: construct, set callbacks, `connect`, `run`. Once
//! closed it is discarded; the manager builds a fresh client per reconnect
//! attempt. Connected/closed state lives in atomics so `close` and the
//! disconnect pipeline stay idempotent however many paths race into them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use mockd_wire::{
    decode_header, encode_header, AuthRequest, ControlMessage, Goaway, ProtocolPort, StreamFlags,
    StreamType, TunnelAuthConfig, WireError, PROTOCOL_VERSION,
};
use quinn::VarInt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::HttpHandler;
use crate::stats::TunnelStats;
use crate::{bridge, endpoint, grpc, http_stream};

/// Dial timeout for TCP connections to the local engine.
pub(crate) const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

// Connection close codes, one per failure step so operational logs can
// pinpoint where a handshake died. 0 is the ordinary client close. Dial
// failures happen before a connection exists, so they carry no code.
const CLOSE_CLIENT: u32 = 0;
const CLOSE_CONTROL_OPEN: u32 = 1;
const CLOSE_AUTH_SEND: u32 = 2;
const CLOSE_AUTH_READ: u32 = 3;
const CLOSE_BAD_VERSION: u32 = 5;
const CLOSE_AUTH_REJECTED: u32 = 6;
const CLOSE_UNEXPECTED_REPLY: u32 = 7;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the relay.
    pub relay_addr: String,
    pub token: String,
    /// Primary local engine port (HTTP/1.1, h2c and WebSocket listeners).
    pub local_port: u16,
    pub protocols: Vec<ProtocolPort>,
    pub tunnel_auth: Option<TunnelAuthConfig>,
    /// Skip relay certificate verification; development only.
    pub insecure: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("relay address {0:?} did not resolve")]
    AddrResolve(String),
    #[error("tls config error: {0}")]
    Tls(String),
    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("stream write error: {0}")]
    Write(#[from] quinn::WriteError),
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),
    #[error("http error: {0}")]
    Http(#[from] http::Error),
    #[error("h2 error: {0}")]
    H2(#[from] h2::Error),
    #[error("auth rejected: {code}: {message}")]
    AuthFailed { code: String, message: String },
    #[error("relay spoke protocol version {0}")]
    BadVersion(u8),
    #[error("unexpected control message during handshake")]
    UnexpectedControl,
    #[error("invalid request metadata: {0}")]
    BadMetadata(String),
    #[error("local dial failed: {0}")]
    LocalDial(std::io::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

type ConnectFn = Box<dyn Fn(&str) + Send + Sync>;
type DisconnectFn = Box<dyn Fn() + Send + Sync>;
type GoawayFn = Box<dyn Fn(Goaway) + Send + Sync>;
type RequestFn = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectFn>,
    on_disconnect: Option<DisconnectFn>,
    on_goaway: Option<GoawayFn>,
    on_request: Option<RequestFn>,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub subdomain: String,
    pub public_url: String,
}

pub struct TunnelClient {
    config: ClientConfig,
    handler: Arc<dyn HttpHandler>,
    stats: Arc<TunnelStats>,
    endpoint: RwLock<Option<quinn::Endpoint>>,
    conn: RwLock<Option<quinn::Connection>>,
    /// Written during the handshake and by pong replies; never by readers.
    control_send: tokio::sync::Mutex<Option<quinn::SendStream>>,
    session: RwLock<Option<SessionInfo>>,
    connected: AtomicBool,
    closed: AtomicBool,
    requests_served: AtomicU64,
    broker_ports: DashMap<String, u16>,
    callbacks: Callbacks,
}

impl TunnelClient {
    pub fn new(
        config: ClientConfig,
        handler: Arc<dyn HttpHandler>,
        stats: Arc<TunnelStats>,
    ) -> Self {
        let broker_ports = DashMap::new();
        for entry in &config.protocols {
            if entry.proto.eq_ignore_ascii_case("mqtt") {
                broker_ports.insert(entry.name.clone().unwrap_or_default(), entry.port);
            }
        }
        Self {
            config,
            handler,
            stats,
            endpoint: RwLock::new(None),
            conn: RwLock::new(None),
            control_send: tokio::sync::Mutex::new(None),
            session: RwLock::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            requests_served: AtomicU64::new(0),
            broker_ports,
            callbacks: Callbacks::default(),
        }
    }

    pub fn set_on_connect(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.on_connect = Some(Box::new(f));
    }

    pub fn set_on_disconnect(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.on_disconnect = Some(Box::new(f));
    }

    pub fn set_on_goaway(&mut self, f: impl Fn(Goaway) + Send + Sync + 'static) {
        self.callbacks.on_goaway = Some(Box::new(f));
    }

    pub fn set_on_request(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.on_request = Some(Box::new(f));
    }

    /// Dial the relay and run the auth handshake on the control stream.
    ///
    /// On success the control-stream reader is spawned and the client is
    /// ready for [`run`](Self::run).
    pub async fn connect(self: Arc<Self>, cancel: &CancellationToken) -> Result<(), TunnelError> {
        if self.connected.load(Ordering::Acquire) {
            return Err(TunnelError::AlreadyConnected);
        }

        let endpoint = endpoint::client_endpoint(self.config.insecure)?;
        let server_name = self
            .config
            .relay_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.config.relay_addr.as_str())
            .to_string();
        let addr = tokio::net::lookup_host(self.config.relay_addr.as_str())
            .await?
            .next()
            .ok_or_else(|| TunnelError::AddrResolve(self.config.relay_addr.clone()))?;

        debug!(%addr, %server_name, "dialling relay");
        let connecting = endpoint.connect(addr, &server_name)?;
        let conn = match connecting.into_0rtt() {
            Ok((conn, _accepted)) => conn,
            Err(connecting) => tokio::select! {
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                established = connecting => established?,
            },
        };

        let (mut send, mut recv) = match conn.open_bi().await {
            Ok(pair) => pair,
            Err(e) => {
                conn.close(VarInt::from_u32(CLOSE_CONTROL_OPEN), b"control stream");
                return Err(e.into());
            }
        };

        let auth = ControlMessage::Auth(AuthRequest {
            token: self.config.token.clone(),
            local_port: self.config.local_port,
            protocols: self.config.protocols.clone(),
            tunnel_auth: self.config.tunnel_auth.clone(),
        });
        let auth_header = auth.to_header()?;
        if let Err(e) = encode_header(&mut send, &auth_header).await {
            conn.close(VarInt::from_u32(CLOSE_AUTH_SEND), b"send auth");
            return Err(e.into());
        }

        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                conn.close(VarInt::from_u32(CLOSE_CLIENT), b"client closing");
                return Err(TunnelError::Cancelled);
            }
            decoded = decode_header(&mut recv) => match decoded {
                Ok(header) => header,
                Err(e) => {
                    conn.close(VarInt::from_u32(CLOSE_AUTH_READ), b"read auth reply");
                    return Err(e.into());
                }
            },
        };

        if reply.version != PROTOCOL_VERSION {
            conn.close(VarInt::from_u32(CLOSE_BAD_VERSION), b"unsupported version");
            return Err(TunnelError::BadVersion(reply.version));
        }

        // A reply that does not decode as a control message is treated the
        // same as an unexpected one.
        let message = match ControlMessage::from_metadata(&reply.metadata) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "auth reply did not decode as a control message");
                conn.close(VarInt::from_u32(CLOSE_UNEXPECTED_REPLY), b"unexpected reply");
                return Err(TunnelError::UnexpectedControl);
            }
        };

        match message {
            ControlMessage::AuthOk(ok) => {
                info!(
                    session_id = %ok.session_id,
                    subdomain = %ok.subdomain,
                    public_url = %ok.public_url,
                    "tunnel authenticated"
                );
                *self.session.write().unwrap() = Some(SessionInfo {
                    session_id: ok.session_id,
                    subdomain: ok.subdomain,
                    public_url: ok.public_url.clone(),
                });
                *self.endpoint.write().unwrap() = Some(endpoint);
                *self.conn.write().unwrap() = Some(conn);
                *self.control_send.lock().await = Some(send);
                self.connected.store(true, Ordering::Release);
                self.stats.mark_connected();
                if let Some(cb) = &self.callbacks.on_connect {
                    cb(&ok.public_url);
                }

                let client = Arc::clone(&self);
                let reader_cancel = cancel.child_token();
                tokio::spawn(async move {
                    client.control_reader(recv, reader_cancel).await;
                });
                Ok(())
            }
            ControlMessage::AuthError(err) => {
                conn.close(VarInt::from_u32(CLOSE_AUTH_REJECTED), b"auth rejected");
                Err(TunnelError::AuthFailed {
                    code: err.code,
                    message: err.message,
                })
            }
            other => {
                debug!(?other, "relay answered auth with an unexpected message");
                conn.close(VarInt::from_u32(CLOSE_UNEXPECTED_REPLY), b"unexpected reply");
                Err(TunnelError::UnexpectedControl)
            }
        }
    }

    /// Accept inbound streams until cancellation, close, or connection loss.
    pub async fn run(self: Arc<Self>, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let conn = self
            .conn
            .read()
            .unwrap()
            .clone()
            .ok_or(TunnelError::NotConnected)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = conn.accept_bi() => match accepted {
                    Ok((send, recv)) => {
                        let client = Arc::clone(&self);
                        let stream_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            client.dispatch_stream(send, recv, stream_cancel).await;
                        });
                    }
                    Err(e) => {
                        if self.closed.load(Ordering::Acquire) || cancel.is_cancelled() {
                            return Ok(());
                        }
                        warn!(error = %e, "relay connection lost");
                        self.run_disconnect();
                        return Err(e.into());
                    }
                },
            }
        }
    }

    /// Decode the initial header and hand the stream to the matching
    /// protocol handler.
    async fn dispatch_stream(
        self: Arc<Self>,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        cancel: CancellationToken,
    ) {
        let work = async {
            let header = match decode_header(&mut recv).await {
                Ok(header) => header,
                Err(e) => {
                    debug!(error = %e, "dropping stream with undecodable header");
                    return;
                }
            };
            let bidirectional = header.flags.contains(StreamFlags::BIDIRECTIONAL);
            match (header.stream_type, bidirectional) {
                (StreamType::Http, false) => http_stream::handle(&self, send, recv, header).await,
                (StreamType::Grpc, true) => grpc::handle(&self, send, recv, header).await,
                (StreamType::Websocket, true) => {
                    bridge::handle_websocket(&self, send, recv, header).await
                }
                (StreamType::Mqtt, true) => bridge::handle_mqtt(&self, send, recv, header).await,
                (stream_type, bidirectional) => {
                    warn!(?stream_type, bidirectional, "no handler for stream");
                    let _ = send.finish();
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => debug!("stream handler cancelled"),
            _ = work => {}
        }
    }

    /// Sequentially process control messages until disconnect or close.
    async fn control_reader(self: Arc<Self>, mut recv: quinn::RecvStream, cancel: CancellationToken) {
        loop {
            let decoded = tokio::select! {
                _ = cancel.cancelled() => return,
                decoded = decode_header(&mut recv) => decoded,
            };
            let header = match decoded {
                Ok(header) => header,
                Err(e) => {
                    // Expected during shutdown; anything else is a dead relay.
                    if !self.closed.load(Ordering::Acquire) {
                        debug!(error = %e, "control stream ended");
                        self.run_disconnect();
                    }
                    return;
                }
            };
            let message = match ControlMessage::from_metadata(&header.metadata) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "skipping malformed control message");
                    continue;
                }
            };

            match message {
                ControlMessage::Goaway(goaway) => {
                    info!(
                        reason = %goaway.reason,
                        drain_timeout_ms = goaway.drain_timeout_ms,
                        "relay sent goaway"
                    );
                    if let Some(cb) = &self.callbacks.on_goaway {
                        cb(goaway);
                    }
                }
                ControlMessage::Ping => {
                    debug!("ping from relay");
                    if let Err(e) = self.send_control(&ControlMessage::Pong).await {
                        debug!(error = %e, "pong reply failed");
                    }
                }
                ControlMessage::Disconnect => {
                    info!("relay requested disconnect");
                    self.run_disconnect();
                    return;
                }
                other => debug!(?other, "ignoring control message"),
            }
        }
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), TunnelError> {
        let header = message.to_header()?;
        let mut guard = self.control_send.lock().await;
        let send = guard.as_mut().ok_or(TunnelError::NotConnected)?;
        encode_header(send, &header).await?;
        Ok(())
    }

    /// Close the control stream and the connection. Idempotent.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Ok(mut guard) = self.control_send.try_lock() {
            if let Some(mut send) = guard.take() {
                let _ = send.finish();
            }
        }
        if let Some(conn) = self.conn.read().unwrap().as_ref() {
            conn.close(VarInt::from_u32(CLOSE_CLIENT), b"client closing");
        }
        if let Some(endpoint) = self.endpoint.read().unwrap().as_ref() {
            endpoint.close(VarInt::from_u32(CLOSE_CLIENT), b"client closing");
        }
        self.run_disconnect();
    }

    /// Flip to disconnected and fire the callback, at most once per client.
    fn run_disconnect(&self) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.stats.mark_disconnected();
        if let Some(cb) = &self.callbacks.on_disconnect {
            cb();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.read().unwrap().as_ref().map(|s| s.session_id.clone())
    }

    pub fn subdomain(&self) -> Option<String> {
        self.session.read().unwrap().as_ref().map(|s| s.subdomain.clone())
    }

    pub fn public_url(&self) -> Option<String> {
        self.session.read().unwrap().as_ref().map(|s| s.public_url.clone())
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub(crate) fn handler(&self) -> &Arc<dyn HttpHandler> {
        &self.handler
    }

    pub(crate) fn stats(&self) -> &Arc<TunnelStats> {
        &self.stats
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.config.local_port
    }

    pub(crate) fn tunnel_auth(&self) -> Option<&TunnelAuthConfig> {
        self.config.tunnel_auth.as_ref()
    }

    /// Local port for a broker name, falling back to the unnamed entry.
    pub(crate) fn broker_port(&self, name: &str) -> Option<u16> {
        self.broker_ports
            .get(name)
            .or_else(|| self.broker_ports.get(""))
            .map(|entry| *entry)
    }

    pub(crate) fn note_request(&self, latency: Duration) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        self.stats.record_request(latency);
        if let Some(cb) = &self.callbacks.on_request {
            cb();
        }
    }
}
