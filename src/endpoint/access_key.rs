use std::fmt::{Debug, Formatter};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

/// The secret an access token is signed with, plus the id of the key if the service issued it
#[derive(Clone, Eq, PartialEq)]
pub struct KeyMaterial {
    pub key_id: Option<String>,
    pub secret: String,
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial{{key_id:{:?}}}", self.key_id)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IdentityKind {
    /// the identity of the host the application server runs on
    ManagedIdentity,
    /// an application registration with a client secret
    Application,
}

#[derive(Clone, Eq, PartialEq)]
pub struct IdentityDescriptor {
    pub kind: IdentityKind,
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Debug for IdentityDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityDescriptor{{kind:{:?},client_id:{:?},tenant_id:{:?}}}", self.kind, self.client_id, self.tenant_id)
    }
}

/// An access key that is obtained from the service in exchange for an identity, and refreshed
///  periodically by the [crate::endpoint::key_manager::EndpointKeyManager]
pub struct IdentityAccessKey {
    descriptor: IdentityDescriptor,
    current: RwLock<Option<KeyMaterial>>,
    authorized: watch::Sender<bool>,
}

impl IdentityAccessKey {
    pub fn new(descriptor: IdentityDescriptor) -> IdentityAccessKey {
        IdentityAccessKey {
            descriptor,
            current: RwLock::new(None),
            authorized: watch::Sender::new(false),
        }
    }

    pub fn descriptor(&self) -> &IdentityDescriptor {
        &self.descriptor
    }

    pub fn current(&self) -> Option<KeyMaterial> {
        self.current.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publishes a new key. The first update marks the key as authorized.
    pub fn update(&self, key: KeyMaterial) {
        debug!("updating identity access key {:?}", key.key_id);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(key);
        self.authorized.send_replace(true);
    }

    pub fn is_authorized(&self) -> bool {
        *self.authorized.borrow()
    }

    pub async fn wait_authorized(&self, timeout: Duration) -> anyhow::Result<KeyMaterial> {
        let mut authorized = self.authorized.subscribe();
        match tokio::time::timeout(timeout, authorized.wait_for(|a| *a)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(anyhow!("access key was dropped")),
            Err(_) => return Err(anyhow!("access key was not authorized within {:?}", timeout)),
        }
        self.current()
            .ok_or_else(|| anyhow!("access key is authorized but has no key material"))
    }
}

#[derive(Clone)]
pub enum AccessKey {
    Static {
        secret: String,
    },
    Identity(Arc<IdentityAccessKey>),
}

impl Debug for AccessKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessKey::Static { .. } => write!(f, "AccessKey::Static"),
            AccessKey::Identity(key) => write!(f, "AccessKey::Identity({:?})", key.descriptor),
        }
    }
}

impl AccessKey {
    /// The current key material. For identity based keys this waits (bounded) for the first
    ///  successful key exchange.
    pub async fn key_material(&self, authorize_timeout: Duration) -> anyhow::Result<KeyMaterial> {
        match self {
            AccessKey::Static { secret } => Ok(KeyMaterial {
                key_id: None,
                secret: secret.clone(),
            }),
            AccessKey::Identity(key) => key.wait_authorized(authorize_timeout).await,
        }
    }

    pub fn as_identity(&self) -> Option<&Arc<IdentityAccessKey>> {
        match self {
            AccessKey::Static { .. } => None,
            AccessKey::Identity(key) => Some(key),
        }
    }
}

/// Mints the bearer token that authenticates a server connection. Token formats are the
///  service's business and live outside this crate.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync + 'static {
    async fn access_token(&self, key: &KeyMaterial, audience: &str) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> IdentityDescriptor {
        IdentityDescriptor {
            kind: IdentityKind::ManagedIdentity,
            client_id: None,
            tenant_id: None,
            client_secret: None,
        }
    }

    #[tokio::test]
    async fn test_static_key() {
        let key = AccessKey::Static { secret: "abc".to_string() };
        let material = key.key_material(Duration::from_secs(1)).await.unwrap();
        assert_eq!(material, KeyMaterial { key_id: None, secret: "abc".to_string() });
        assert!(key.as_identity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_key_not_authorized() {
        let key = IdentityAccessKey::new(identity());
        assert!(!key.is_authorized());
        assert!(key.wait_authorized(Duration::from_secs(10)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_key_authorized_later() {
        let key = Arc::new(IdentityAccessKey::new(identity()));

        let waiter = {
            let key = AccessKey::Identity(key.clone());
            tokio::spawn(async move { key.key_material(Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        key.update(KeyMaterial { key_id: Some("k1".to_string()), secret: "s1".to_string() });
        assert!(key.is_authorized());

        let material = waiter.await.unwrap().unwrap();
        assert_eq!(material.key_id.as_deref(), Some("k1"));
    }

    #[test]
    fn test_debug_does_not_leak_secrets() {
        let material = KeyMaterial { key_id: Some("k1".to_string()), secret: "top-secret".to_string() };
        assert!(!format!("{:?}", material).contains("top-secret"));
        assert!(!format!("{:?}", AccessKey::Static { secret: "top-secret".to_string() }).contains("top-secret"));
    }
}
