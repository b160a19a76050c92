use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub tunnel: TunnelSection,
}

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_addr")]
    pub addr: String,
    #[serde(default)]
    pub insecure: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: default_relay_addr(),
            insecure: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    #[serde(default)]
    pub protocols: Vec<ProtocolEntry>,
    pub auth: Option<AuthSection>,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            token: String::new(),
            local_port: default_local_port(),
            protocols: Vec::new(),
            auth: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProtocolEntry {
    #[serde(rename = "type")]
    pub proto: String,
    pub port: u16,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthSection {
    #[serde(rename = "type")]
    pub auth_type: String,
    pub token: Option<String>,
    pub token_header: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {path}"))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))
    }
}

fn default_relay_addr() -> String {
    mockd_tunnel::DEFAULT_RELAY_ADDR.to_string()
}

fn default_local_port() -> u16 {
    4280
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.relay.addr, mockd_tunnel::DEFAULT_RELAY_ADDR);
        assert!(config.tunnel.enabled);
        assert_eq!(config.tunnel.local_port, 4280);
        assert!(config.tunnel.protocols.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            [relay]
            addr = "relay.dev.mockd.io:4443"
            insecure = true

            [tunnel]
            token = "tok"
            local_port = 8080

            [[tunnel.protocols]]
            type = "mqtt"
            port = 1883
            name = "sensors"

            [tunnel.auth]
            type = "token"
            token = "inbound"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.relay.addr, "relay.dev.mockd.io:4443");
        assert!(config.relay.insecure);
        assert_eq!(config.tunnel.token, "tok");
        assert_eq!(config.tunnel.protocols.len(), 1);
        assert_eq!(config.tunnel.protocols[0].proto, "mqtt");
        let auth = config.tunnel.auth.unwrap();
        assert_eq!(auth.auth_type, "token");
        assert_eq!(auth.token.as_deref(), Some("inbound"));
    }
}
