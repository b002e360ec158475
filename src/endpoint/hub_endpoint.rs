use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ServiceOptions;
use crate::connection::service_connection::MessageDispatcher;
use crate::connection::transport::ConnectionFactory;
use crate::endpoint::service_endpoint::ServiceEndpoint;
use crate::pool::connection_pool::ConnectionPool;

/// An endpoint as seen by one hub: the hub's own copy of the endpoint's runtime state, and the
///  hub's connection pool to it
pub struct HubServiceEndpoint {
    hub: String,
    endpoint: ServiceEndpoint,
    pool: Arc<ConnectionPool>,
    scale_ready: watch::Sender<bool>,
}

impl HubServiceEndpoint {
    pub fn new(
        hub: &str,
        endpoint: &ServiceEndpoint,
        options: Arc<ServiceOptions>,
        factory: Arc<dyn ConnectionFactory>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> HubServiceEndpoint {
        let endpoint = endpoint.detached();
        let pool = ConnectionPool::new(hub, endpoint.clone(), options, factory, dispatcher);
        HubServiceEndpoint {
            hub: hub.to_string(),
            endpoint,
            pool,
            scale_ready: watch::Sender::new(false),
        }
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn start(&self) {
        self.pool.start();
    }

    pub fn is_scale_ready(&self) -> bool {
        *self.scale_ready.borrow()
    }

    /// Waits for the pool to reach steady state, i.e. for all its fixed connections to be
    ///  connected. Returns `false` if that did not happen within `timeout`.
    pub async fn wait_for_scale_ready(&self, timeout: Duration) -> bool {
        if self.is_scale_ready() {
            return true;
        }

        match tokio::time::timeout(timeout, self.pool.wait_for_ready()).await {
            Ok(()) => {
                info!(hub = %self.hub, endpoint = ?self.endpoint, "endpoint is ready");
                self.scale_ready.send_replace(true);
                true
            }
            Err(_) => {
                warn!(hub = %self.hub, endpoint = ?self.endpoint, "endpoint did not become ready within {:?}", timeout);
                false
            }
        }
    }
}
