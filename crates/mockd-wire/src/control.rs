//! Control messages exchanged on the dedicated control stream.
//!
//! Wire format: `{"type": "...", "payload": {...}}`, carried as the JSON
//! metadata of a [`StreamType::Control`](crate::frame::StreamType) header.
//! Unknown types decode to [`ControlMessage::Unknown`] so a newer relay
//! never crashes an older agent.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::{StreamFlags, StreamHeader, StreamType, WireError};

/// Messages on the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Agent authenticates and announces its local ports.
    Auth(AuthRequest),

    /// Relay accepted the agent; carries the public routing identity.
    AuthOk(AuthOk),

    /// Relay rejected the agent.
    AuthError(AuthError),

    /// Keepalive probe from the relay.
    Ping,

    /// Keepalive reply.
    Pong,

    /// Relay is dropping this agent; the reader terminates.
    Disconnect,

    /// Relay wants to drain and redeploy; the agent should reconnect.
    Goaway(Goaway),

    /// Any type this agent does not recognise.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocols: Vec<ProtocolPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_auth: Option<TunnelAuthConfig>,
}

/// One entry of the agent's protocol-port table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolPort {
    #[serde(rename = "type")]
    pub proto: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthOk {
    pub session_id: String,
    pub subdomain: String,
    pub public_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goaway {
    pub reason: String,
    pub drain_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Inbound-auth policy the agent asks the relay to enforce, and falls back
/// to enforcing itself on half-duplex HTTP streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelAuthConfig {
    #[serde(rename = "type")]
    pub auth_type: TunnelAuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelAuthType {
    None,
    Token,
    Basic,
    Ip,
}

impl ControlMessage {
    /// JSON-encode into stream-header metadata bytes.
    pub fn to_metadata(&self) -> Result<Bytes, WireError> {
        Ok(serde_json::to_vec(self)?.into())
    }

    /// Decode from stream-header metadata bytes.
    pub fn from_metadata(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Wrap this message in a control stream header.
    pub fn to_header(&self) -> Result<StreamHeader, WireError> {
        Ok(StreamHeader::new(
            StreamType::Control,
            StreamFlags::empty(),
            self.to_metadata()?,
        ))
    }
}
