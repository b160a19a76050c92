//! The seam between the tunnel and the local mock engine.
//!
//! Half-duplex HTTP streams are served in-process: the tunnel builds an
//! [`http::Request`] whose body reads straight off the QUIC stream and
//! hands it to the configured [`HttpHandler`]. The response body streams
//! back onto the same QUIC stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

use crate::stats::TunnelStats;

/// Errors a handler may surface; the tunnel converts them to a 500.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The mock engine's request-serving contract.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn serve(
        &self,
        req: Request<RequestBody>,
    ) -> Result<Response<ResponseBody>, HandlerError>;
}

/// Request body backed by the stream's receive half.
///
/// When the request carries a `Content-Length` the body is clamped to it so
/// handlers using framed reads see EOF at the right byte; otherwise it runs
/// to the stream FIN. Handlers only ever hold the receive half, so nothing
/// they do can close the send half the response goes out on.
pub struct RequestBody {
    inner: Take<quinn::RecvStream>,
    stats: Arc<TunnelStats>,
}

impl RequestBody {
    pub(crate) fn new(
        recv: quinn::RecvStream,
        content_length: Option<u64>,
        stats: Arc<TunnelStats>,
    ) -> Self {
        Self {
            inner: recv.take(content_length.unwrap_or(u64::MAX)),
            stats,
        }
    }

    /// Read the remaining body into memory.
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

impl AsyncRead for RequestBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.stats.add_bytes_in(n as u64);
            }
        }
        poll
    }
}

/// Response body returned by a handler.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    /// Streamed raw onto the QUIC stream after the response header.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Empty
    }

    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        ResponseBody::Stream(Box::new(reader))
    }
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        ResponseBody::Full(value)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        ResponseBody::Full(value.into())
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        ResponseBody::Full(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        ResponseBody::Full(value.into())
    }
}
