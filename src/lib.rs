//! Transport layer between application servers and a hosted real-time messaging relay.
//!
//! Clients connect to the relay rather than to application servers. The relay forwards client
//!  lifecycle events and payloads over a small number of persistent, multiplexed
//!  [connection::service_connection::ServiceConnection]s per endpoint, and application servers
//!  use the same connections to push messages back to connections, users, groups or everybody.

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod util;
