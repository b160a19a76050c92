//! Raw HTTP/1.1 plumbing for bridged streams.
//!
//! Bidirectional non-gRPC streams (WebSocket upgrades) talk to a local
//! listener that expects plain HTTP/1.1, so the agent synthesizes the
//! on-the-wire request itself and parses the service's response head before
//! handing both directions over to the byte bridge.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::frame::{WireError, MAX_METADATA_LEN};
use crate::metadata::HttpMetadata;

const MAX_HEADERS: usize = 64;

/// Build the CRLF-delimited request line plus headers, ending with an empty
/// line.
///
/// The method defaults to `GET` and the path to `/`. Exactly one `Host`
/// header is written, sourced from the metadata's `host` or the fallback;
/// any `Host` entries among the metadata headers are suppressed. All other
/// headers are emitted one line per value, preserving input casing.
pub fn synthesize_request(meta: &HttpMetadata, fallback_host: &str) -> Vec<u8> {
    let method = if meta.method.is_empty() {
        "GET"
    } else {
        meta.method.as_str()
    };
    let path = if meta.path.is_empty() {
        "/"
    } else {
        meta.path.as_str()
    };
    let host = if meta.host.is_empty() {
        fallback_host
    } else {
        meta.host.as_str()
    };

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(method.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, values) in &meta.header {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        for value in values {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b"\r\n");
    out
}

/// Read and parse an HTTP/1.1 response head (status line + headers) from a
/// local service.
///
/// Returns the parsed head as [`HttpMetadata`] plus whatever bytes were read
/// past the blank line; the caller must prepend that carry-over to the
/// stream it bridges.
pub async fn read_response_head<R>(reader: &mut R) -> Result<(HttpMetadata, Bytes), WireError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.len() > MAX_METADATA_LEN {
            return Err(WireError::OversizedMetadata { len: buf.len() });
        }
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response head",
            )));
        }

        let parsed = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut headers);
            match resp.parse(&buf)? {
                httparse::Status::Complete(head_len) => {
                    let mut meta = HttpMetadata {
                        status_code: resp.code.unwrap_or(0),
                        ..Default::default()
                    };
                    for h in resp.headers.iter() {
                        meta.add_header(h.name, String::from_utf8_lossy(h.value).into_owned());
                    }
                    Some((head_len, meta))
                }
                httparse::Status::Partial => None,
            }
        };

        if let Some((head_len, meta)) = parsed {
            buf.advance(head_len);
            return Ok((meta, buf.freeze()));
        }
    }
}
