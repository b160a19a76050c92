//! gRPC forwarding over cleartext HTTP/2.
//!
//! gRPC needs real HTTP/2 trailers, so these streams bypass the in-process
//! handler and speak h2c straight to the local listener. The response goes
//! back as a header (status + headers), length-prefixed body chunks, the
//! end-of-body sentinel, and finally a trailer-flagged header carrying the
//! trailer map. That trailer-after-body framing is what distinguishes gRPC
//! from every other stream type.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Method, Request, Version};
use mockd_wire::{encode_header, write_chunk, HttpMetadata, StreamFlags, StreamHeader, StreamType};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::client::{TunnelClient, TunnelError, LOCAL_DIAL_TIMEOUT};
use crate::http_stream::write_error;

const RESPONSE_CHUNK: usize = 32 * 1024;
const READ_BUF: usize = 32 * 1024;

pub(crate) async fn handle(
    client: &Arc<TunnelClient>,
    mut send: quinn::SendStream,
    recv: quinn::RecvStream,
    header: StreamHeader,
) {
    let started = Instant::now();

    let meta: HttpMetadata = match header.metadata_json() {
        Ok(meta) => meta,
        Err(e) => {
            debug!(error = %e, "malformed grpc metadata");
            let _ = write_error(&mut send, StreamType::Grpc, 400, "bad request metadata").await;
            let _ = send.finish();
            return;
        }
    };

    match forward(client, &mut send, recv, &meta).await {
        Ok(()) => {
            client.note_request(started.elapsed());
        }
        Err(TunnelError::LocalDial(e)) => {
            warn!(error = %e, port = client.local_port(), "local grpc listener unreachable");
            let _ = write_error(&mut send, StreamType::Grpc, 502, "local service unreachable").await;
        }
        Err(e) => {
            debug!(error = %e, "grpc forward failed");
        }
    }

    let _ = send.finish();
}

async fn forward(
    client: &Arc<TunnelClient>,
    send: &mut quinn::SendStream,
    recv: quinn::RecvStream,
    meta: &HttpMetadata,
) -> Result<(), TunnelError> {
    let port = client.local_port();
    let tcp = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .map_err(|_| {
            TunnelError::LocalDial(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timed out",
            ))
        })?
        .map_err(TunnelError::LocalDial)?;

    let (sender, connection) = h2::client::handshake(tcp).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "h2 connection terminated");
        }
    });
    let mut sender = sender.ready().await?;

    let request = build_request(meta, port)?;
    let (response, request_body) = sender.send_request(request, false)?;

    // Pump the request body on its own task so bidirectional streaming
    // calls make progress in both directions.
    let pump = tokio::spawn(copy_request_body(recv, request_body, Arc::clone(client.stats())));

    let response = response.await?;
    let (parts, mut body) = response.into_parts();

    let mut resp_meta = HttpMetadata {
        status_code: parts.status.as_u16(),
        ..Default::default()
    };
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            resp_meta.add_header(name.as_str(), value);
        }
    }
    let resp_header =
        StreamHeader::with_json(StreamType::Grpc, StreamFlags::BIDIRECTIONAL, &resp_meta)?;
    encode_header(send, &resp_header).await?;

    let mut flow = body.flow_control().clone();
    while let Some(frame) = body.data().await {
        let frame = frame?;
        for chunk in frame.chunks(RESPONSE_CHUNK) {
            write_chunk(send, chunk).await?;
        }
        client.stats().add_bytes_out(frame.len() as u64);
        let _ = flow.release_capacity(frame.len());
    }
    write_chunk(send, &[]).await?;

    // The h2 stack populates trailers lazily once the body is drained.
    let mut trailer_meta = HttpMetadata::default();
    if let Some(trailers) = body.trailers().await? {
        for (name, value) in trailers.iter() {
            if let Ok(value) = value.to_str() {
                trailer_meta
                    .trailer
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
    }
    let trailer_header =
        StreamHeader::with_json(StreamType::Grpc, StreamFlags::TRAILER, &trailer_meta)?;
    encode_header(send, &trailer_header).await?;

    // The RPC is over; anything left of the request body is moot.
    pump.abort();
    Ok(())
}

fn build_request(meta: &HttpMetadata, port: u16) -> Result<Request<()>, TunnelError> {
    let path = if meta.path.is_empty() {
        "/"
    } else {
        meta.path.as_str()
    };
    let method = if meta.method.is_empty() {
        Method::POST
    } else {
        Method::from_bytes(meta.method.as_bytes())
            .map_err(|_| TunnelError::BadMetadata(format!("method {:?}", meta.method)))?
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://127.0.0.1:{port}{path}"))
        .version(Version::HTTP_2);

    for (name, values) in &meta.header {
        // Connection-specific HTTP/1 headers are illegal in h2 requests;
        // :authority comes from the URI.
        if is_connection_header(name) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            let Ok(value) = HeaderValue::from_str(value) else {
                continue;
            };
            builder = builder.header(&name, value);
        }
    }

    Ok(builder.body(())?)
}

fn is_connection_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}

/// Copy the relay stream into the h2 request body, honouring h2 flow
/// control, and end the stream when the relay finishes its send side.
async fn copy_request_body(
    mut recv: quinn::RecvStream,
    mut tx: h2::SendStream<Bytes>,
    stats: Arc<crate::stats::TunnelStats>,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(n)) => {
                stats.add_bytes_in(n as u64);
                let mut data = Bytes::copy_from_slice(&buf[..n]);
                while !data.is_empty() {
                    tx.reserve_capacity(data.len());
                    match std::future::poll_fn(|cx| tx.poll_capacity(cx)).await {
                        Some(Ok(capacity)) if capacity > 0 => {
                            let chunk = data.split_to(capacity.min(data.len()));
                            if tx.send_data(chunk, false).is_err() {
                                return;
                            }
                        }
                        _ => return,
                    }
                }
            }
            Ok(None) => {
                let _ = tx.send_data(Bytes::new(), true);
                return;
            }
            Err(e) => {
                debug!(error = %e, "request body read failed");
                tx.send_reset(h2::Reason::CANCEL);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_and_uri() {
        let meta = HttpMetadata {
            path: "/pkg.Service/Method".into(),
            ..Default::default()
        };
        let request = build_request(&meta, 50051).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            request.uri().to_string(),
            "http://127.0.0.1:50051/pkg.Service/Method"
        );
        assert_eq!(request.version(), Version::HTTP_2);
    }

    #[test]
    fn connection_headers_stripped() {
        let mut meta = HttpMetadata {
            method: "POST".into(),
            path: "/x".into(),
            ..Default::default()
        };
        meta.add_header("Connection", "keep-alive");
        meta.add_header("Host", "public.example");
        meta.add_header("te", "trailers");
        meta.add_header("grpc-timeout", "5S");

        let request = build_request(&meta, 4280).unwrap();
        assert!(request.headers().get("connection").is_none());
        assert!(request.headers().get("host").is_none());
        assert_eq!(request.headers().get("te").unwrap(), "trailers");
        assert_eq!(request.headers().get("grpc-timeout").unwrap(), "5S");
    }
}
