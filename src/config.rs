use std::time::Duration;

use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::warn;

use crate::endpoint::service_endpoint::{EndpointType, ServiceEndpoint};
use crate::error::ServiceTransportError;

/// Controls whether the service may move client connections to another application server when
///  this server's connection goes away
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum MigrationLevel {
    #[default]
    Off = 0,
    /// only migrate when this server shuts down gracefully
    ShutdownOnly = 1,
    All = 2,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub endpoints: Vec<ServiceEndpoint>,

    /// number of fixed connections per (hub, endpoint) pair
    pub connection_count: usize,

    /// identifies this application server towards the service, sent when connecting
    pub server_name: String,
    pub migration_level: MigrationLevel,

    pub handshake_timeout: Duration,
    /// While a debugger is attached, the handshake is not bounded by [ServiceOptions::handshake_timeout].
    ///  There is no portable way of detecting a debugger, so this is configured explicitly.
    pub debugger_attached: bool,

    /// interval of the keepalive check, and the time without outbound traffic after which a
    ///  keepalive ping is sent
    pub keep_alive_interval: Duration,
    /// a connection without any inbound traffic for this long is considered dead and reconnected
    pub service_timeout: Duration,

    pub ack_timeout: Duration,

    /// bounds waiting for a new endpoint to become ready, and for a removed endpoint to drain
    pub scale_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,

    pub access_key_refresh_interval: Duration,
    /// bounds waiting for an identity based access key's first successful refresh when connecting
    pub access_key_authorize_timeout: Duration,

    pub max_frame_size: usize,
}

impl ServiceOptions {
    pub fn new(endpoints: Vec<ServiceEndpoint>) -> ServiceOptions {
        ServiceOptions {
            endpoints,
            connection_count: 5,
            server_name: default_server_name(),
            migration_level: MigrationLevel::Off,
            handshake_timeout: Duration::from_secs(15),
            debugger_attached: false,
            keep_alive_interval: Duration::from_secs(5),
            service_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            scale_timeout: Duration::from_secs(15 * 60),
            graceful_shutdown_timeout: Duration::from_secs(30),
            access_key_refresh_interval: Duration::from_secs(5 * 60),
            access_key_authorize_timeout: Duration::from_secs(10),
            max_frame_size: 16 * 1024 * 1024,
        }
    }

    /// Convenience for the common case of configuring endpoints by connection string. Each
    ///  entry is a pair of an optional `name[:primary|secondary]` key and the connection string.
    pub fn from_connection_strings<'a>(entries: impl IntoIterator<Item = (Option<&'a str>, &'a str)>) -> anyhow::Result<ServiceOptions> {
        let mut endpoints = Vec::new();
        for (key, connection_string) in entries {
            let endpoint = match key {
                Some(key) => ServiceEndpoint::from_config_entry(key, connection_string)?,
                None => ServiceEndpoint::from_connection_string(connection_string)?,
            };
            endpoints.push(endpoint);
        }
        let result = ServiceOptions::new(endpoints);
        result.validate()?;
        Ok(result)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_endpoints(&self.endpoints)?;

        if self.connection_count == 0 {
            bail!(ServiceTransportError::Configuration("connection count must be at least 1".to_string()));
        }
        if self.service_timeout <= self.keep_alive_interval {
            bail!(ServiceTransportError::Configuration(format!(
                "service timeout {:?} must be longer than the keepalive interval {:?}",
                self.service_timeout, self.keep_alive_interval,
            )));
        }
        if self.keep_alive_interval.is_zero() {
            bail!(ServiceTransportError::Configuration("keepalive interval must not be zero".to_string()));
        }
        if self.max_frame_size < 1024 {
            bail!(ServiceTransportError::Configuration("max frame size is too small".to_string()));
        }
        Ok(())
    }
}

/// Startup validation of an endpoint list. This is fatal and synchronous: without at least one
///  primary endpoint, clients can not be assigned anywhere.
pub fn validate_endpoints(endpoints: &[ServiceEndpoint]) -> anyhow::Result<()> {
    if endpoints.is_empty() {
        bail!(ServiceTransportError::Configuration("no service endpoint is configured".to_string()));
    }
    if !endpoints.iter().any(|e| e.endpoint_type() == EndpointType::Primary) {
        bail!(ServiceTransportError::Configuration("at least one primary service endpoint is required".to_string()));
    }
    Ok(())
}

fn default_server_name() -> String {
    match std::env::var("HOSTNAME").or_else(|_| std::env::var("COMPUTERNAME")) {
        Ok(host) => format!("{}_{}", host, uuid::Uuid::new_v4().simple()),
        Err(_) => {
            warn!("host name is not available, using a random server name");
            uuid::Uuid::new_v4().simple().to_string()
        }
    }
}
