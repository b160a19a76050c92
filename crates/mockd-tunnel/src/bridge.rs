//! Raw bidirectional byte bridging for WebSocket and MQTT streams.
//!
//! Both protocols reduce to the same shape once set up: two concurrent
//! copiers, one per direction, with ordered half-close semantics. When the
//! relay direction ends the local TCP write side is shut down so the
//! service sees EOF; when the local direction ends the QUIC send half is
//! finished. Centralising the pump here keeps the two handlers from
//! drifting apart.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use mockd_wire::{
    encode_header, http1, HttpMetadata, MqttMetadata, StreamFlags, StreamHeader, StreamType,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::client::{TunnelClient, LOCAL_DIAL_TIMEOUT};
use crate::http_stream::write_error;
use crate::stats::TunnelStats;

/// WebSocket upgrade: replay the HTTP/1.1 handshake against the local
/// listener, report its response head to the relay, then bridge bytes.
pub(crate) async fn handle_websocket(
    client: &Arc<TunnelClient>,
    mut send: quinn::SendStream,
    recv: quinn::RecvStream,
    header: StreamHeader,
) {
    let meta: HttpMetadata = match header.metadata_json() {
        Ok(meta) => meta,
        Err(e) => {
            debug!(error = %e, "malformed websocket metadata");
            let _ = write_error(&mut send, StreamType::Websocket, 400, "bad request metadata").await;
            let _ = send.finish();
            return;
        }
    };

    let port = client.local_port();
    let mut tcp = match dial_local(port).await {
        Ok(tcp) => tcp,
        Err(e) => {
            warn!(error = %e, port, "local websocket listener unreachable");
            let _ = write_error(&mut send, StreamType::Websocket, 502, "local service unreachable")
                .await;
            let _ = send.finish();
            return;
        }
    };

    let fallback_host = format!("127.0.0.1:{port}");
    let upgrade = http1::synthesize_request(&meta, &fallback_host);
    if let Err(e) = tcp.write_all(&upgrade).await {
        debug!(error = %e, "writing upgrade request failed");
        let _ = send.finish();
        return;
    }

    // Bytes the head parser read past the blank line belong to the
    // local→relay direction and are prepended below.
    let (head, carry_over) = match http1::read_response_head(&mut tcp).await {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "local service sent an unparseable response head");
            let _ = write_error(&mut send, StreamType::Websocket, 502, "bad local response").await;
            let _ = send.finish();
            return;
        }
    };
    debug!(status = head.status_code, "local service answered upgrade");

    let resp_header = match StreamHeader::with_json(
        StreamType::Websocket,
        StreamFlags::BIDIRECTIONAL,
        &head,
    ) {
        Ok(h) => h,
        Err(e) => {
            debug!(error = %e, "response header encode failed");
            let _ = send.finish();
            return;
        }
    };
    if encode_header(&mut send, &resp_header).await.is_err() {
        let _ = send.finish();
        return;
    }

    bridge(send, recv, tcp, carry_over, client.stats()).await;
}

/// MQTT passthrough: no HTTP envelope, just a port lookup, an empty
/// confirmation header and the byte bridge.
pub(crate) async fn handle_mqtt(
    client: &Arc<TunnelClient>,
    mut send: quinn::SendStream,
    recv: quinn::RecvStream,
    header: StreamHeader,
) {
    let meta: MqttMetadata = match header.metadata_json() {
        Ok(meta) => meta,
        Err(e) => {
            debug!(error = %e, "malformed mqtt metadata");
            let _ = send.finish();
            return;
        }
    };

    let Some(port) = client.broker_port(&meta.broker_name) else {
        debug!(broker = %meta.broker_name, "no local broker mapped; dropping stream");
        let _ = send.finish();
        return;
    };

    let tcp = match dial_local(port).await {
        Ok(tcp) => tcp,
        Err(e) => {
            warn!(error = %e, port, broker = %meta.broker_name, "local broker unreachable");
            let _ = send.finish();
            return;
        }
    };

    let confirm = StreamHeader::new(StreamType::Mqtt, StreamFlags::BIDIRECTIONAL, Bytes::new());
    if encode_header(&mut send, &confirm).await.is_err() {
        let _ = send.finish();
        return;
    }

    bridge(send, recv, tcp, Bytes::new(), client.stats()).await;
}

async fn dial_local(port: u16) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "local dial timed out",
        )),
    }
}

async fn bridge(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    tcp: TcpStream,
    carry_over: Bytes,
    stats: &Arc<TunnelStats>,
) {
    let (tcp_read, mut tcp_write) = tcp.into_split();

    let inbound = async move {
        let copied = tokio::io::copy(&mut recv, &mut tcp_write).await;
        // Half-close so the local service sees EOF on its read side while
        // its own writes keep flowing.
        let _ = tcp_write.shutdown().await;
        copied.unwrap_or(0)
    };

    let outbound = async move {
        let mut local = Cursor::new(carry_over).chain(tcp_read);
        let copied = tokio::io::copy(&mut local, &mut send).await;
        let _ = send.finish();
        copied.unwrap_or(0)
    };

    let (bytes_in, bytes_out) = tokio::join!(inbound, outbound);
    stats.add_bytes_in(bytes_in);
    stats.add_bytes_out(bytes_out);
    debug!(bytes_in, bytes_out, "bridge finished");
}
