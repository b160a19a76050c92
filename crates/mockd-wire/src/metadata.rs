//! Per-protocol stream metadata carried in stream headers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata for HTTP, gRPC and WebSocket streams.
///
/// Requests and responses share the shape; which fields are populated
/// depends on the direction. Unrecognised JSON fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "status_is_unset")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trailer: HashMap<String, Vec<String>>,
}

fn status_is_unset(code: &u16) -> bool {
    *code == 0
}

impl HttpMetadata {
    /// First value of a header, matched case-insensitively.
    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first())
            .map(String::as_str)
    }

    /// Parsed `Content-Length`, if present and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.first_header("content-length")?.trim().parse().ok()
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.header.entry(name.into()).or_default().push(value.into());
    }
}

/// Metadata for native MQTT streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqttMetadata {
    /// Routing key into the agent's broker-port table.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub broker_name: String,
    /// Advisory only; the broker re-reads it from the CONNECT packet.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_metadata_round_trip() {
        let mut meta = HttpMetadata {
            method: "POST".into(),
            path: "/echo".into(),
            host: "abc.example".into(),
            status_code: 0,
            ..Default::default()
        };
        meta.add_header("Content-Type", "application/json");
        meta.add_header("X-Multi", "a");
        meta.add_header("X-Multi", "b");

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: HttpMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.header["X-Multi"], vec!["a", "b"]);
    }

    #[test]
    fn unknown_fields_ignored() {
        let raw = r#"{"method":"GET","path":"/","later_extension":true}"#;
        let parsed: HttpMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.method, "GET");
    }

    #[test]
    fn content_length_lookup_is_case_insensitive() {
        let mut meta = HttpMetadata::default();
        meta.add_header("Content-Length", "42");
        assert_eq!(meta.content_length(), Some(42));
        assert_eq!(meta.first_header("CONTENT-LENGTH"), Some("42"));
    }

    #[test]
    fn content_length_garbage_is_none() {
        let mut meta = HttpMetadata::default();
        meta.add_header("content-length", "many");
        assert_eq!(meta.content_length(), None);
    }

    #[test]
    fn mqtt_metadata_round_trip() {
        let meta = MqttMetadata {
            broker_name: "sensors".into(),
            client_id: "dev-1".into(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: MqttMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn status_code_omitted_when_zero() {
        let meta = HttpMetadata {
            method: "GET".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("status_code"));
    }
}
