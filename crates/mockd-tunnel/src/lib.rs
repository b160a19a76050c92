//! Agent-side QUIC tunnel for the mockd relay.
//!
//! A [`TunnelClient`] dials the relay, authenticates on a dedicated control
//! stream, and bridges inbound public traffic (HTTP, gRPC, WebSocket, MQTT)
//! to the locally running mock engine. The [`TunnelManager`] wraps the
//! single-use client with an enable/disable lifecycle and reconnects with
//! exponential backoff when the relay drains via `GOAWAY`.

pub mod auth;
mod bridge;
pub mod client;
pub mod endpoint;
mod grpc;
pub mod handler;
mod http_stream;
pub mod manager;
pub mod stats;

pub use client::{ClientConfig, TunnelClient, TunnelError};
pub use handler::{HandlerError, HttpHandler, RequestBody, ResponseBody};
pub use manager::{
    ManagerOptions, TunnelConfig, TunnelManager, TunnelStatus, DEFAULT_RELAY_ADDR,
};
pub use stats::{TunnelStats, TunnelStatsSnapshot};
