use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use mockd_tunnel::{
    HandlerError, HttpHandler, ManagerOptions, RequestBody, ResponseBody, TunnelConfig,
    TunnelManager,
};
use mockd_wire::{ProtocolPort, TunnelAuthConfig, TunnelAuthType};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

/// Built-in handler used when the agent runs without an attached engine:
/// answers the health probe and 404s everything else.
struct StandaloneHandler;

#[async_trait]
impl HttpHandler for StandaloneHandler {
    async fn serve(
        &self,
        req: http::Request<RequestBody>,
    ) -> Result<http::Response<ResponseBody>, HandlerError> {
        let response = if req.uri().path() == "/healthz" {
            http::Response::builder()
                .status(200)
                .header("Content-Type", "application/json")
                .body(ResponseBody::from(r#"{"status":"ok","service":"mockd-agent"}"#))?
        } else {
            http::Response::builder()
                .status(404)
                .header("Content-Type", "text/plain")
                .body(ResponseBody::from("no mock engine attached\n"))?
        };
        Ok(response)
    }
}

fn parse_auth(section: &config::AuthSection) -> Option<TunnelAuthConfig> {
    let auth_type = match section.auth_type.as_str() {
        "none" => TunnelAuthType::None,
        "token" => TunnelAuthType::Token,
        "basic" => TunnelAuthType::Basic,
        "ip" => TunnelAuthType::Ip,
        other => {
            tracing::warn!(auth_type = other, "unknown tunnel auth type; ignoring");
            return None;
        }
    };
    Some(TunnelAuthConfig {
        auth_type,
        token: section.token.clone(),
        token_header: section.token_header.clone(),
        username: section.username.clone(),
        password: section.password.clone(),
        allowed_ips: section.allowed_ips.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mockd_agent=info,mockd_tunnel=info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    let relay_addr = args.relay.unwrap_or(config.relay.addr);
    let insecure = args.insecure || config.relay.insecure;
    if insecure {
        tracing::warn!("relay certificate verification is disabled");
    }

    let manager = TunnelManager::new(
        Arc::new(StandaloneHandler),
        ManagerOptions {
            relay_addr,
            insecure,
            on_status_change: Some(Box::new(|status, public_url, session_id, transport| {
                tracing::info!(
                    %status,
                    public_url = public_url.unwrap_or("-"),
                    session_id = session_id.unwrap_or("-"),
                    transport,
                    "tunnel status"
                );
            })),
        },
    );

    manager.enable(Some(TunnelConfig {
        enabled: config.tunnel.enabled,
        token: config.tunnel.token,
        local_port: config.tunnel.local_port,
        protocols: config
            .tunnel
            .protocols
            .iter()
            .map(|p| ProtocolPort {
                proto: p.proto.clone(),
                port: p.port,
                name: p.name.clone(),
            })
            .collect(),
        tunnel_auth: config.tunnel.auth.as_ref().and_then(parse_auth),
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    manager.close();
    tracing::info!(stats = %manager.stats(), "final tunnel stats");
    Ok(())
}
