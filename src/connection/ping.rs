//! Pings carry a flat `[key, value, key, value, ...]` list. An empty ping is a plain keepalive;
//!  the keys below carry control information between the service and application servers.

use tracing::debug;

use crate::endpoint::service_endpoint::EndpointMetrics;
use crate::protocol::messages::PingData;

/// the service asks this server to open an on-demand connection to the given target
pub const KEY_TARGET: &str = "target";
/// `"1"` while the endpoint has clients routed to it, `"0"` otherwise
pub const KEY_STATUS: &str = "status";
/// graceful offline handshake: sent as [OFFLINE_REQUEST], answered with [OFFLINE_ACK]
pub const KEY_OFFLINE: &str = "offline";
pub const KEY_CLIENT_COUNT: &str = "clientcount";
pub const KEY_SERVER_COUNT: &str = "servercount";
pub const KEY_CAPACITY: &str = "capacity";

pub const OFFLINE_REQUEST: &str = "fin";
pub const OFFLINE_ACK: &str = "finack";

impl PingData {
    pub fn keepalive() -> PingData {
        PingData::default()
    }

    pub fn offline_request() -> PingData {
        PingData {
            messages: vec![KEY_OFFLINE.to_string(), OFFLINE_REQUEST.to_string()],
        }
    }

    /// the value for a key, if present. A dangling key without a value is ignored.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.messages
            .chunks_exact(2)
            .find(|kv| kv[0] == key)
            .map(|kv| kv[1].as_str())
    }

    pub fn target(&self) -> Option<&str> {
        self.get(KEY_TARGET)
            .filter(|t| !t.is_empty())
    }

    pub fn status(&self) -> Option<bool> {
        match self.get(KEY_STATUS)? {
            "1" => Some(true),
            "0" => Some(false),
            other => {
                debug!("unexpected endpoint status value {:?} - ignoring", other);
                None
            }
        }
    }

    pub fn is_offline_ack(&self) -> bool {
        self.get(KEY_OFFLINE) == Some(OFFLINE_ACK)
    }

    /// Endpoint metrics, if this ping carries any. Missing values are taken from `previous`.
    pub fn metrics(&self, previous: &EndpointMetrics) -> Option<EndpointMetrics> {
        let client_count = self.parse_count(KEY_CLIENT_COUNT);
        let server_count = self.parse_count(KEY_SERVER_COUNT);
        let capacity = self.parse_count(KEY_CAPACITY);

        if client_count.is_none() && server_count.is_none() && capacity.is_none() {
            return None;
        }

        Some(EndpointMetrics {
            client_connection_count: client_count.unwrap_or(previous.client_connection_count),
            server_connection_count: server_count.unwrap_or(previous.server_connection_count),
            connection_capacity: capacity.unwrap_or(previous.connection_capacity),
        })
    }

    fn parse_count(&self, key: &str) -> Option<u64> {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                debug!("non-numeric value {:?} for ping key {} - ignoring", raw, key);
                None
            }
        }
    }
}
