//! Connection configuration and state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ConnectionConfig
// ---------------------------------------------------------------------------

/// Per-connection liveness and framing settings.
///
/// Shared by both ends: a server applies its copy to every accepted
/// connection, a client to its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Start pings automatically at this interval once connected.
    /// `None` leaves them off until `start_pings` is called.
    pub ping_interval: Option<Duration>,

    /// Start keepalives automatically at this interval once connected.
    pub keepalive_interval: Option<Duration>,

    /// A peer is considered dead after `keepalive_interval` times this
    /// many intervals without any received traffic.
    pub keepalive_timeout_multiplier: u32,

    /// Largest partial frame the stream reader will buffer.
    pub max_frame_size: usize,
}

impl ConnectionConfig {
    /// The liveness deadline for a keepalive interval.
    pub fn keepalive_deadline(&self, interval: Duration) -> Duration {
        interval * self.keepalive_timeout_multiplier.max(1)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval: None,
            keepalive_interval: Some(Duration::from_secs(5)),
            keepalive_timeout_multiplier: 3,
            max_frame_size: 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Where and how a client connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or IP address of the server.
    pub address: String,

    /// The server's TCP port. Its UDP port is learned from the handshake.
    pub port: u16,

    /// Upper bound for the TCP connect plus the Identify handshake.
    pub connect_timeout: Duration,

    pub connection: ConnectionConfig,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 19999,
            connect_timeout: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a connection.
///
/// ```text
/// Disconnected → Connecting → Connected → Disconnected
/// ```
///
/// A failed connect goes straight from `Connecting` back to
/// `Disconnected`. Server-side connections are born `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Returns `true` if commands can be sent.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.ping_interval, None);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.keepalive_timeout_multiplier, 3);
    }

    #[test]
    fn test_keepalive_deadline_multiplies_interval() {
        let config = ConnectionConfig::default();
        assert_eq!(
            config.keepalive_deadline(Duration::from_millis(100)),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_keepalive_deadline_never_below_one_interval() {
        let config = ConnectionConfig {
            keepalive_timeout_multiplier: 0,
            ..ConnectionConfig::default()
        };
        assert_eq!(
            config.keepalive_deadline(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_client_config_partial_json_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"port": 4000}"#).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_connection_state_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
    }
}
