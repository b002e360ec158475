pub mod connection_pool;
pub mod selection;
