//! Binary stream framing.
//!
//! Every stream begins with an 8-byte header followed by variable JSON
//! metadata:
//!
//! ```text
//! Byte 0:     Version (currently 1)
//! Byte 1:     Stream type
//! Byte 2:     Flags
//! Byte 3:     Reserved
//! Bytes 4-7:  Metadata length (u32, big-endian)
//! ```
//!
//! Stream bodies are carried as length-prefixed chunks: a u32 big-endian
//! length then that many bytes. A zero-length chunk is the end-of-body
//! sentinel.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 8;

/// Maximum stream-header metadata length (64 KiB).
pub const MAX_METADATA_LEN: usize = 64 * 1024;

/// Maximum body chunk length (4 MiB).
pub const MAX_CHUNK_LEN: usize = 4 * 1024 * 1024;

/// Stream type carried in byte 1 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    Control = 0,
    Http = 1,
    Mqtt = 2,
    Grpc = 3,
    Websocket = 4,
}

impl TryFrom<u8> for StreamType {
    type Error = WireError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamType::Control),
            1 => Ok(StreamType::Http),
            2 => Ok(StreamType::Mqtt),
            3 => Ok(StreamType::Grpc),
            4 => Ok(StreamType::Websocket),
            _ => Err(WireError::UnknownStreamType(value)),
        }
    }
}

bitflags::bitflags! {
    /// Flag byte of a stream header. Unknown bits are retained so they
    /// survive a decode/encode round trip.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamFlags: u8 {
        /// Stream stays open in both directions after the initial metadata.
        const BIDIRECTIONAL = 0x01;
        /// Header carries gRPC trailers, sent after the end-of-body sentinel.
        const TRAILER = 0x02;

        const _ = !0;
    }
}

/// A decoded stream header: fixed prefix plus raw metadata bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u8,
    pub stream_type: StreamType,
    pub flags: StreamFlags,
    pub metadata: Bytes,
}

impl StreamHeader {
    pub fn new(stream_type: StreamType, flags: StreamFlags, metadata: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            stream_type,
            flags,
            metadata,
        }
    }

    /// Build a header whose metadata is the JSON encoding of `payload`.
    pub fn with_json<T: Serialize>(
        stream_type: StreamType,
        flags: StreamFlags,
        payload: &T,
    ) -> Result<Self, WireError> {
        let metadata = serde_json::to_vec(payload)?;
        Ok(Self::new(stream_type, flags, metadata.into()))
    }

    /// Decode the metadata bytes as JSON.
    pub fn metadata_json<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(serde_json::from_slice(&self.metadata)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("metadata too large: {len} bytes (max {MAX_METADATA_LEN})")]
    OversizedMetadata { len: usize },
    #[error("body chunk too large: {len} bytes (max {MAX_CHUNK_LEN})")]
    OversizedChunk { len: usize },
    #[error("unknown stream type: {0}")]
    UnknownStreamType(u8),
    #[error("http response parse error: {0}")]
    Http1Parse(#[from] httparse::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write the fixed 8 bytes then the metadata in a single write.
pub async fn encode_header<W>(writer: &mut W, header: &StreamHeader) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = header.metadata.len();
    if len > MAX_METADATA_LEN {
        return Err(WireError::OversizedMetadata { len });
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
    buf.put_u8(header.version);
    buf.put_u8(header.stream_type as u8);
    buf.put_u8(header.flags.bits());
    buf.put_u8(0); // reserved
    buf.put_u32(len as u32);
    buf.put_slice(&header.metadata);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read and validate one stream header.
///
/// The version byte is passed through untouched; callers decide whether an
/// unexpected version is fatal.
pub async fn decode_header<R>(reader: &mut R) -> Result<StreamHeader, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; HEADER_SIZE];
    reader.read_exact(&mut fixed).await?;

    let version = fixed[0];
    let stream_type = StreamType::try_from(fixed[1])?;
    let flags = StreamFlags::from_bits_retain(fixed[2]);
    let len = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]) as usize;
    if len > MAX_METADATA_LEN {
        return Err(WireError::OversizedMetadata { len });
    }

    let mut metadata = vec![0u8; len];
    reader.read_exact(&mut metadata).await?;

    Ok(StreamHeader {
        version,
        stream_type,
        flags,
        metadata: metadata.into(),
    })
}

/// Write one length-prefixed body chunk. An empty slice emits the
/// end-of-body sentinel.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = data.len();
    if len > MAX_CHUNK_LEN {
        return Err(WireError::OversizedChunk { len });
    }
    writer.write_all(&(len as u32).to_be_bytes()).await?;
    if !data.is_empty() {
        writer.write_all(data).await?;
    }
    Ok(())
}

/// Read one body chunk. Returns empty [`Bytes`] for the sentinel.
pub async fn read_chunk<R>(reader: &mut R) -> Result<Bytes, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_CHUNK_LEN {
        return Err(WireError::OversizedChunk { len });
    }
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data.into())
}
