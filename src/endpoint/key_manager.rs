use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ServiceOptions;
use crate::endpoint::access_key::{IdentityDescriptor, KeyMaterial};
use crate::endpoint::service_endpoint::ServiceEndpoint;

/// Obtains an access key from the service in exchange for an identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessKeyExchange: Send + Sync + 'static {
    async fn exchange(&self, endpoint_url: &str, identity: &IdentityDescriptor) -> anyhow::Result<KeyMaterial>;
}

/// Keeps the identity based access keys of all endpoints fresh. Keys are shared by all clones of
///  an endpoint, so every hub's connections see a refreshed key.
pub struct EndpointKeyManager {
    exchange: Arc<dyn AccessKeyExchange>,
    refresh_interval: Duration,
    endpoints: Mutex<Vec<ServiceEndpoint>>,
    stopped: watch::Sender<bool>,
}

impl EndpointKeyManager {
    pub fn new(options: &ServiceOptions, exchange: Arc<dyn AccessKeyExchange>) -> Arc<EndpointKeyManager> {
        let result = EndpointKeyManager {
            exchange,
            refresh_interval: options.access_key_refresh_interval,
            endpoints: Default::default(),
            stopped: watch::Sender::new(false),
        };
        for endpoint in &options.endpoints {
            result.add_endpoint(endpoint);
        }
        Arc::new(result)
    }

    /// Returns `false` for endpoints with a static key, and for endpoints that are managed already
    pub fn add_endpoint(&self, endpoint: &ServiceEndpoint) -> bool {
        if endpoint.access_key().as_identity().is_none() {
            return false;
        }

        let mut endpoints = self.endpoints.lock()
            .unwrap_or_else(|e| e.into_inner());
        if endpoints.contains(endpoint) {
            return false;
        }
        debug!(endpoint = ?endpoint, "managing identity access key");
        endpoints.push(endpoint.clone());
        true
    }

    pub fn remove_endpoint(&self, endpoint: &ServiceEndpoint) -> bool {
        let mut endpoints = self.endpoints.lock()
            .unwrap_or_else(|e| e.into_inner());
        let len_before = endpoints.len();
        endpoints.retain(|e| e != endpoint);
        endpoints.len() != len_before
    }

    /// Refreshes all keys concurrently. A failed refresh leaves the previous key in place. Returns
    ///  the number of keys that were refreshed.
    pub async fn refresh_all(&self) -> usize {
        let endpoints = self.endpoints.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let refreshed = join_all(endpoints.iter().map(|e| self.refresh(e)))
            .await
            .into_iter()
            .filter(|r| *r)
            .count();
        debug!("refreshed {} of {} access keys", refreshed, endpoints.len());
        refreshed
    }

    async fn refresh(&self, endpoint: &ServiceEndpoint) -> bool {
        let Some(key) = endpoint.access_key().as_identity() else {
            return false;
        };

        match self.exchange.exchange(endpoint.url(), key.descriptor()).await {
            Ok(material) => {
                key.update(material);
                true
            }
            Err(e) => {
                warn!(endpoint = ?endpoint, "failed to refresh access key, keeping the previous one: {}", e);
                false
            }
        }
    }

    /// Refreshes all keys right away, and then periodically until [EndpointKeyManager::stop] is called
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            info!("starting access key refresh every {:?}", this.refresh_interval);
            let mut stopped = this.stopped.subscribe();

            loop {
                this.refresh_all().await;

                select! {
                    _ = sleep(this.refresh_interval) => {}
                    _ = stopped.wait_for(|s| *s) => break,
                }
            }
            debug!("access key refresh stopped");
        });
    }

    pub fn stop(&self) {
        self.stopped.send_replace(true);
    }
}
