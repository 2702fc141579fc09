use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_bind_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_discovery_port() -> u16 {
    35999
}

fn default_discovery_window_ms() -> u64 {
    500
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_max_frame_bytes() -> u32 {
    64 * 1024 * 1024
}

fn default_heartbeat_ms() -> u64 {
    2_000
}

/// Process-wide configuration for a [`Context`](https://docs.rs/conduit-runtime).
///
/// Constructible programmatically via [`ContextConfig::new`] or loaded from a
/// TOML document with [`ContextConfig::from_toml`] (§1a). The protocol
/// version is a compile-time constant rather than a config field: it
/// identifies this implementation of the wire format, not a deployment choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub context_name: String,
    pub workgroup: String,
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub bind_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
}

/// The wire protocol version this crate speaks (§6 handshake).
pub const PROTOCOL_VERSION: u32 = 1;

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_name: String::new(),
            workgroup: "default".to_owned(),
            bind_host: default_bind_host(),
            bind_port: 0,
            discovery_port: default_discovery_port(),
            discovery_window_ms: default_discovery_window_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            heartbeat_interval_ms: default_heartbeat_ms(),
        }
    }
}

impl ContextConfig {
    pub fn new(context_name: impl Into<String>, workgroup: impl Into<String>) -> Self {
        Self {
            context_name: context_name.into(),
            workgroup: workgroup.into(),
            ..Default::default()
        }
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_toml_document_with_defaults_filled_in() {
        let cfg = ContextConfig::from_toml(
            r#"
            context_name = "a"
            workgroup = "lab"
            bind_port = 40001
            "#,
        )
        .unwrap();
        assert_eq!(cfg.context_name, "a");
        assert_eq!(cfg.discovery_port, 35999);
        assert_eq!(cfg.max_frame_bytes, 64 * 1024 * 1024);
    }
}
