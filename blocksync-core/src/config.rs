//! Session and server configuration.
//!
//! All four channels derive from one base port: command, then
//! publish/subscribe, ingest, and heartbeat on the three ports above it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{ReplicationError, Result};

/// Protocol version exchanged during the auth handshake. Client and server
/// must agree exactly.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reserved principal meaning "any client may claim this node".
pub const COMMON_OWNER: &str = "COMMON";

/// Principal used for server-originated commands.
pub const SERVER_OWNER: &str = "server";

/// Connection settings shared by client and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Server host (client side) or bind address (server side).
    pub host: String,
    /// Base port; the three ports above it are derived.
    pub base_port: u16,
    /// Milliseconds a peer may stay silent before it is considered lost.
    /// Also bounds the auth handshake.
    pub connection_timeout_ms: u64,
    /// Milliseconds of silence after which an unsolicited ping is sent.
    pub ping_interval_ms: u64,
    /// Heartbeat bookkeeping tick, in milliseconds.
    pub ttl_tick_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: 5560,
            connection_timeout_ms: 5000,
            ping_interval_ms: 1000,
            ttl_tick_ms: 1000,
        }
    }
}

impl SessionConfig {
    /// Command channel (control commands, both directions).
    pub fn command_port(&self) -> u16 {
        self.base_port
    }

    /// Publish/subscribe channel (server-to-client datablock fan-out and
    /// snapshot pulls).
    pub fn subscribe_port(&self) -> u16 {
        self.base_port + 1
    }

    /// Ingest channel (client-to-server steady-state updates).
    pub fn ingest_port(&self) -> u16 {
        self.base_port + 2
    }

    /// Heartbeat channel.
    pub fn ttl_port(&self) -> u16 {
        self.base_port + 3
    }

    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.host, self.command_port())
    }

    pub fn subscribe_addr(&self) -> String {
        format!("{}:{}", self.host, self.subscribe_port())
    }

    pub fn ingest_addr(&self) -> String {
        format!("{}:{}", self.host, self.ingest_port())
    }

    pub fn ttl_addr(&self) -> String {
        format!("{}:{}", self.host, self.ttl_port())
    }

    /// Load a config from a JSON file; missing file yields the default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| ReplicationError::Data(format!("failed to parse config: {e}")))
    }

    /// Save the config as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| ReplicationError::Data(format!("failed to serialize config: {e}")))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_ports() {
        let config = SessionConfig {
            base_port: 6000,
            ..Default::default()
        };
        assert_eq!(config.command_port(), 6000);
        assert_eq!(config.subscribe_port(), 6001);
        assert_eq!(config.ingest_port(), 6002);
        assert_eq!(config.ttl_port(), 6003);
    }

    #[test]
    fn test_missing_config_file_is_default() {
        let config = SessionConfig::load(Path::new("/nonexistent/blocksync.json")).unwrap();
        assert_eq!(config.base_port, SessionConfig::default().base_port);
    }
}
