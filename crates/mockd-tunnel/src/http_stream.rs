//! Half-duplex HTTP stream handling.
//!
//! The relay sends request metadata in the stream header and the request
//! body as the remaining stream bytes; the agent serves the request
//! in-process and answers with a response header followed by raw body
//! bytes on the same stream.

use std::sync::Arc;
use std::time::Instant;

use http::header::{HeaderName, HeaderValue};
use http::{Method, Request, Response};
use mockd_wire::{encode_header, HttpMetadata, StreamFlags, StreamHeader, StreamType};
use tracing::{debug, warn};

use crate::auth;
use crate::client::{TunnelClient, TunnelError};
use crate::handler::{RequestBody, ResponseBody};
use crate::stats::TunnelStats;

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
            debug!(error = %e, "malformed http metadata");
            let _ = write_error(&mut send, StreamType::Http, 400, "bad request metadata").await;
            let _ = send.finish();
            return;
        }
    };

    if let Some(cfg) = client.tunnel_auth() {
        if !auth::authorize(cfg, &meta) {
            debug!(path = %meta.path, "inbound tunnel auth rejected request");
            let _ = write_error(&mut send, StreamType::Http, 401, "unauthorized").await;
            let _ = send.finish();
            return;
        }
    }

    let request = match build_request(client, &meta, recv) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "unusable request metadata");
            let _ = write_error(&mut send, StreamType::Http, 400, "bad request metadata").await;
            let _ = send.finish();
            return;
        }
    };

    match client.handler().serve(request).await {
        Ok(response) => {
            if let Err(e) = write_response(&mut send, response, client.stats()).await {
                debug!(error = %e, "response write failed");
            }
        }
        Err(e) => {
            warn!(error = %e, "local handler failed");
            let _ = write_error(&mut send, StreamType::Http, 500, "handler error").await;
        }
    }

    let _ = send.finish();
    client.note_request(started.elapsed());
}

fn build_request(
    client: &Arc<TunnelClient>,
    meta: &HttpMetadata,
    recv: quinn::RecvStream,
) -> Result<Request<RequestBody>, TunnelError> {
    let method = if meta.method.is_empty() {
        Method::GET
    } else {
        Method::from_bytes(meta.method.as_bytes())
            .map_err(|_| TunnelError::BadMetadata(format!("method {:?}", meta.method)))?
    };
    let path = if meta.path.is_empty() {
        "/"
    } else {
        meta.path.as_str()
    };

    let mut builder = Request::builder().method(method).uri(path);
    if !meta.host.is_empty() {
        builder = builder.header(http::header::HOST, meta.host.as_str());
    }
    for (name, values) in &meta.header {
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

    // A parsed Content-Length clamps the body so framed reads see EOF at
    // the declared end instead of waiting for the stream FIN.
    let body = RequestBody::new(recv, meta.content_length(), Arc::clone(client.stats()));
    Ok(builder.body(body)?)
}

async fn write_response(
    send: &mut quinn::SendStream,
    response: Response<ResponseBody>,
    stats: &Arc<TunnelStats>,
) -> Result<(), TunnelError> {
    let (parts, body) = response.into_parts();
    let mut meta = HttpMetadata {
        status_code: parts.status.as_u16(),
        ..Default::default()
    };
    for (name, value) in parts.headers.iter() {
        if let Ok(value) = value.to_str() {
            meta.add_header(name.as_str(), value);
        }
    }

    let header = StreamHeader::with_json(StreamType::Http, StreamFlags::empty(), &meta)?;
    encode_header(send, &header).await?;

    match body {
        ResponseBody::Empty => {}
        ResponseBody::Full(bytes) => {
            send.write_all(&bytes).await?;
            stats.add_bytes_out(bytes.len() as u64);
        }
        ResponseBody::Stream(mut reader) => {
            let copied = tokio::io::copy(&mut reader, send).await?;
            stats.add_bytes_out(copied);
        }
    }
    Ok(())
}

/// One-shot plain-text error response, shared by every dispatcher.
pub(crate) async fn write_error(
    send: &mut quinn::SendStream,
    stream_type: StreamType,
    status: u16,
    body: &str,
) -> Result<(), TunnelError> {
    let mut meta = HttpMetadata {
        status_code: status,
        ..Default::default()
    };
    meta.add_header("Content-Type", "text/plain");
    let header = StreamHeader::with_json(stream_type, StreamFlags::empty(), &meta)?;
    encode_header(send, &header).await?;
    send.write_all(body.as_bytes()).await?;
    Ok(())
}
