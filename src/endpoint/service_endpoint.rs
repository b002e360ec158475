use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::bail;
use tracing::debug;
use url::Url;

use crate::endpoint::access_key::{AccessKey, IdentityAccessKey, IdentityDescriptor, IdentityKind};
use crate::error::ServiceTransportError;

const SUPPORTED_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum EndpointType {
    /// clients are negotiated to primary endpoints whenever one is online
    #[default]
    Primary,
    /// a fallback for negotiation, and a relay for messages of clients connected elsewhere
    Secondary,
}

/// load figures reported by the service through pings
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct EndpointMetrics {
    pub client_connection_count: u64,
    pub server_connection_count: u64,
    pub connection_capacity: u64,
}

/// Runtime state of an endpoint, shared by all clones of a [ServiceEndpoint]
struct EndpointState {
    online: AtomicBool,
    active: AtomicBool,
    metrics: RwLock<EndpointMetrics>,
}

/// A service endpoint: a URL with credentials, a role and a name. Two endpoints are the same
///  endpoint if URL, role and name are equal; credentials and runtime state are not part of
///  the identity.
#[derive(Clone)]
pub struct ServiceEndpoint {
    url: String,
    endpoint_type: EndpointType,
    name: String,
    access_key: AccessKey,
    state: Arc<EndpointState>,
}

impl Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServiceEndpoint{{{}:{:?}", self.url, self.endpoint_type)?;
        if !self.name.is_empty() {
            write!(f, " ({})", self.name)?;
        }
        write!(f, "}}")
    }
}

impl PartialEq for ServiceEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.endpoint_type == other.endpoint_type && self.name == other.name
    }
}
impl Eq for ServiceEndpoint {}

impl Hash for ServiceEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.endpoint_type.hash(state);
        self.name.hash(state);
    }
}

impl ServiceEndpoint {
    pub fn new(url: &str, port: Option<u16>, endpoint_type: EndpointType, name: &str, access_key: AccessKey) -> anyhow::Result<ServiceEndpoint> {
        let mut parsed = Url::parse(url)
            .map_err(|e| ServiceTransportError::Configuration(format!("invalid endpoint URL {:?}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!(ServiceTransportError::Configuration(format!("endpoint URL must be http or https: {:?}", url)));
        }
        if port.is_some() && parsed.set_port(port).is_err() {
            bail!(ServiceTransportError::Configuration(format!("cannot set port for endpoint URL {:?}", url)));
        }

        Ok(ServiceEndpoint {
            url: parsed.as_str().trim_end_matches('/').to_string(),
            endpoint_type,
            name: name.to_string(),
            access_key,
            state: Arc::new(EndpointState {
                online: AtomicBool::new(false),
                active: AtomicBool::new(true),
                metrics: Default::default(),
            }),
        })
    }

    /// Parses `Endpoint=https://...;AccessKey=...;Version=1.0;Port=8080;AuthType=...;ClientId=...`.
    ///  Keys are case insensitive.
    pub fn from_connection_string(connection_string: &str) -> anyhow::Result<ServiceEndpoint> {
        Self::parse(connection_string, EndpointType::Primary, "")
    }

    /// Parses a configuration entry whose key has the form `name[:primary|secondary]`
    pub fn from_config_entry(key: &str, connection_string: &str) -> anyhow::Result<ServiceEndpoint> {
        let (name, endpoint_type) = match key.rsplit_once(':') {
            None => (key, EndpointType::Primary),
            Some((name, suffix)) => match suffix.to_ascii_lowercase().as_str() {
                "primary" => (name, EndpointType::Primary),
                "secondary" => (name, EndpointType::Secondary),
                _ => bail!(ServiceTransportError::Configuration(format!("unknown endpoint type {:?} in {:?}", suffix, key))),
            },
        };
        Self::parse(connection_string, endpoint_type, name)
    }

    fn parse(connection_string: &str, endpoint_type: EndpointType, name: &str) -> anyhow::Result<ServiceEndpoint> {
        let config_err = |msg: String| ServiceTransportError::Configuration(msg);

        let mut endpoint = None;
        let mut access_key = None;
        let mut port = None;
        let mut auth_type = None;
        let mut client_id = None;
        let mut tenant_id = None;
        let mut client_secret = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((key, value)) = part.split_once('=') else {
                bail!(config_err(format!("connection string segment without '=': {:?}", part)));
            };
            let value = value.trim().to_string();

            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "accesskey" => access_key = Some(value),
                "version" => {
                    if value != SUPPORTED_VERSION {
                        bail!(config_err(format!("unsupported connection string version {:?}", value)));
                    }
                }
                "port" => {
                    let p = value.parse::<u16>()
                        .map_err(|_| config_err(format!("invalid port {:?}", value)))?;
                    port = Some(p);
                }
                "authtype" => auth_type = Some(value.to_ascii_lowercase()),
                "clientid" => client_id = Some(value),
                "tenantid" => tenant_id = Some(value),
                "clientsecret" => client_secret = Some(value),
                other => debug!("ignoring unknown connection string key {:?}", other),
            }
        }

        let Some(endpoint) = endpoint else {
            bail!(config_err("connection string has no 'Endpoint'".to_string()));
        };

        let access_key = match auth_type.as_deref() {
            None => match access_key {
                Some(secret) => AccessKey::Static { secret },
                None => bail!(config_err(format!("connection string for {} has neither 'AccessKey' nor 'AuthType'", endpoint))),
            },
            Some(auth_type) => {
                let kind = match auth_type {
                    "azure.msi" => IdentityKind::ManagedIdentity,
                    "azure.app" => IdentityKind::Application,
                    "aad" if client_secret.is_some() => IdentityKind::Application,
                    "aad" => IdentityKind::ManagedIdentity,
                    other => bail!(config_err(format!("unsupported auth type {:?}", other))),
                };
                if kind == IdentityKind::Application && (client_id.is_none() || tenant_id.is_none() || client_secret.is_none()) {
                    bail!(config_err(format!("application identity for {} requires 'ClientId', 'TenantId' and 'ClientSecret'", endpoint)));
                }
                AccessKey::Identity(Arc::new(IdentityAccessKey::new(IdentityDescriptor {
                    kind,
                    client_id,
                    tenant_id,
                    client_secret,
                })))
            }
        };

        ServiceEndpoint::new(&endpoint, port, endpoint_type, name, access_key)
    }

    /// The same endpoint with runtime state of its own. Every hub tracks the state of its
    ///  endpoints separately.
    pub fn detached(&self) -> ServiceEndpoint {
        ServiceEndpoint {
            url: self.url.clone(),
            endpoint_type: self.endpoint_type,
            name: self.name.clone(),
            access_key: self.access_key.clone(),
            state: Arc::new(EndpointState {
                online: AtomicBool::new(false),
                active: AtomicBool::new(true),
                metrics: Default::default(),
            }),
        }
    }

    /// normalized, without trailing slash, port folded in
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    /// at least one connection to this endpoint is connected
    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::Release);
    }

    /// the service routes clients to this endpoint. It reports `false` while an endpoint is
    ///  being removed and has no more clients.
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.state.active.store(active, Ordering::Release);
    }

    pub fn metrics(&self) -> EndpointMetrics {
        *self.state.metrics.read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn update_metrics(&self, metrics: EndpointMetrics) {
        *self.state.metrics.write()
            .unwrap_or_else(|e| e.into_inner()) = metrics;
    }
}
