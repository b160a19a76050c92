//! Wire protocol spoken between a mockd agent and the relay.
//!
//! Every QUIC stream starts with a fixed binary [`frame::StreamHeader`]
//! carrying JSON metadata; control messages and per-protocol request
//! metadata are defined here so the agent and relay share one vocabulary.

pub mod control;
pub mod frame;
pub mod http1;
pub mod metadata;

pub use control::{
    AuthError, AuthOk, AuthRequest, ControlMessage, Goaway, ProtocolPort, TunnelAuthConfig,
    TunnelAuthType,
};
pub use frame::{
    decode_header, encode_header, read_chunk, write_chunk, StreamFlags, StreamHeader, StreamType,
    WireError, HEADER_SIZE, MAX_CHUNK_LEN, MAX_METADATA_LEN, PROTOCOL_VERSION,
};
pub use metadata::{HttpMetadata, MqttMetadata};
