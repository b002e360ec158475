pub mod access_key;
pub mod container;
pub mod hub_endpoint;
pub mod key_manager;
pub mod router;
pub mod service_endpoint;
