//! Agent-side enforcement of the inbound tunnel-auth policy.
//!
//! The relay is asked to enforce this policy at the edge; the agent applies
//! the same checks to half-duplex HTTP streams as a fallback so a
//! misconfigured relay cannot expose the engine unauthenticated. A failed
//! check answers the relay with 401 and never affects the connection.

use std::net::IpAddr;

use base64::Engine as _;
use ipnet::IpNet;
use mockd_wire::{HttpMetadata, TunnelAuthConfig, TunnelAuthType};

/// Header consulted by the `token` auth type when none is configured.
pub const DEFAULT_TOKEN_HEADER: &str = "X-Tunnel-Token";

/// Returns true when the request described by `meta` passes the policy.
pub fn authorize(cfg: &TunnelAuthConfig, meta: &HttpMetadata) -> bool {
    match cfg.auth_type {
        TunnelAuthType::None => true,
        TunnelAuthType::Token => check_token(cfg, meta),
        TunnelAuthType::Basic => check_basic(cfg, meta),
        TunnelAuthType::Ip => check_ip(cfg, meta),
    }
}

fn check_token(cfg: &TunnelAuthConfig, meta: &HttpMetadata) -> bool {
    let header = cfg.token_header.as_deref().unwrap_or(DEFAULT_TOKEN_HEADER);
    match (cfg.token.as_deref(), meta.first_header(header)) {
        (Some(expected), Some(got)) => !expected.is_empty() && got == expected,
        _ => false,
    }
}

fn check_basic(cfg: &TunnelAuthConfig, meta: &HttpMetadata) -> bool {
    let (Some(user), Some(pass)) = (cfg.username.as_deref(), cfg.password.as_deref()) else {
        return false;
    };
    let Some(value) = meta.first_header("authorization") else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == pass,
        None => false,
    }
}

fn check_ip(cfg: &TunnelAuthConfig, meta: &HttpMetadata) -> bool {
    // The relay terminates the public connection; the caller's address only
    // reaches the agent via X-Forwarded-For. Fail closed without it.
    let Some(xff) = meta.first_header("x-forwarded-for") else {
        return false;
    };
    let Some(first) = xff.split(',').next() else {
        return false;
    };
    let Ok(ip) = first.trim().parse::<IpAddr>() else {
        return false;
    };

    cfg.allowed_ips.iter().any(|entry| {
        if let Ok(net) = entry.parse::<IpNet>() {
            return net.contains(&ip);
        }
        // Bare addresses are accepted as /32 (or /128) entries.
        entry.parse::<IpAddr>().is_ok_and(|allowed| allowed == ip)
    })
}
