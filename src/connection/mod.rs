pub mod ack_handler;
pub mod backoff;
pub mod keepalive;
pub mod ping;
pub mod service_connection;
pub mod transport;
pub mod websocket;

#[cfg(test)] pub mod test_transport;
