//! Server configuration.

use partyline_transport::ConnectionConfig;
use serde::{Deserialize, Serialize};

/// Where the server listens and how many clients it admits.
///
/// Every field has a default, so a JSON file only needs the fields it
/// changes:
///
/// ```
/// # use partyline::ServerConfig;
/// let config: ServerConfig = serde_json::from_str(r#"{"port": 7000}"#).unwrap();
/// assert_eq!(config.max_clients, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or IP address to bind.
    pub address: String,

    /// TCP port. The UDP socket binds the same port number; `0` picks
    /// ephemeral ports for both.
    pub port: u16,

    /// Connections beyond this many are closed right after accept.
    pub max_clients: usize,

    /// Listen backlog for the TCP socket.
    pub backlog: u32,

    /// Applied to every accepted connection.
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 19999,
            max_clients: 4,
            backlog: 10,
            connection: ConnectionConfig::default(),
        }
    }
}
