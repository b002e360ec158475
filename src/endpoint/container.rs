use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::bail;
use futures::future::{join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::config::{validate_endpoints, ServiceOptions};
use crate::connection::service_connection::MessageDispatcher;
use crate::connection::transport::ConnectionFactory;
use crate::endpoint::hub_endpoint::HubServiceEndpoint;
use crate::endpoint::router::{endpoints_for_message, EndpointRouter};
use crate::endpoint::service_endpoint::ServiceEndpoint;
use crate::error::ServiceTransportError;
use crate::pool::connection_pool::ConnectionPool;
use crate::protocol::messages::{AckStatus, ServiceMessage};

/// The container's view of its endpoints. It is replaced as a whole on every change.
#[derive(Clone, Default)]
struct EndpointTable {
    /// every endpoint that has a pool, including endpoints that are not ready yet or draining
    hub_endpoints: FxHashMap<ServiceEndpoint, Arc<HubServiceEndpoint>>,
    /// endpoints that messages are written to
    routable: Vec<ServiceEndpoint>,
    /// endpoints that clients may be negotiated to
    negotiable: Vec<ServiceEndpoint>,
}

/// All endpoints of one hub. Outbound messages are fanned out to the endpoints the router picks,
///  and endpoints can be added and removed at runtime.
pub struct MultiEndpointContainer {
    hub: String,
    options: Arc<ServiceOptions>,
    factory: Arc<dyn ConnectionFactory>,
    dispatcher: Arc<dyn MessageDispatcher>,
    router: Arc<dyn EndpointRouter>,

    table: RwLock<Arc<EndpointTable>>,
    started: AtomicBool,
}

impl MultiEndpointContainer {
    /// Fails if the options are invalid, e.g. if there is no primary endpoint
    pub fn new(
        hub: &str,
        options: Arc<ServiceOptions>,
        factory: Arc<dyn ConnectionFactory>,
        dispatcher: Arc<dyn MessageDispatcher>,
        router: Arc<dyn EndpointRouter>,
    ) -> anyhow::Result<Arc<MultiEndpointContainer>> {
        options.validate()?;

        let mut table = EndpointTable::default();
        for endpoint in &options.endpoints {
            if table.hub_endpoints.contains_key(endpoint) {
                warn!(hub, endpoint = ?endpoint, "endpoint is configured more than once, ignoring duplicate");
                continue;
            }
            let hub_endpoint = HubServiceEndpoint::new(hub, endpoint, options.clone(), factory.clone(), dispatcher.clone());
            table.routable.push(hub_endpoint.endpoint().clone());
            table.negotiable.push(hub_endpoint.endpoint().clone());
            table.hub_endpoints.insert(hub_endpoint.endpoint().clone(), Arc::new(hub_endpoint));
        }

        Ok(Arc::new(MultiEndpointContainer {
            hub: hub.to_string(),
            options,
            factory,
            dispatcher,
            router,
            table: RwLock::new(Arc::new(table)),
            started: AtomicBool::new(false),
        }))
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    fn table(&self) -> Arc<EndpointTable> {
        self.table.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_table<T>(&self, f: impl FnOnce(&mut EndpointTable) -> T) -> T {
        let mut table = self.table.write()
            .unwrap_or_else(|e| e.into_inner());
        let mut updated = EndpointTable::clone(&table);
        let result = f(&mut updated);
        *table = Arc::new(updated);
        result
    }

    pub fn hub_endpoints(&self) -> Vec<Arc<HubServiceEndpoint>> {
        self.table().hub_endpoints.values().cloned().collect()
    }

    /// the hub's copies of the endpoints that messages are written to
    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        self.table().routable.clone()
    }

    pub fn negotiable_endpoints(&self) -> Vec<ServiceEndpoint> {
        self.table().negotiable.clone()
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(hub = %self.hub, "starting connections to {} endpoints", self.table().hub_endpoints.len());
        for hub_endpoint in self.table().hub_endpoints.values() {
            hub_endpoint.start();
        }
    }

    pub fn stop(&self) {
        for hub_endpoint in self.table().hub_endpoints.values() {
            hub_endpoint.pool().stop();
        }
    }

    /// Graceful shutdown: asks the service to move clients away from all connections, then stops
    ///  them
    pub async fn offline(&self) {
        let table = self.table();
        let timeout = self.options.graceful_shutdown_timeout;
        join_all(table.hub_endpoints.values().map(|e| e.pool().offline(timeout))).await;
        self.stop();
    }

    pub fn negotiate_endpoint(&self) -> anyhow::Result<ServiceEndpoint> {
        self.router.get_negotiate_endpoint(&self.table().negotiable)
    }

    fn target_pools(&self, msg: &ServiceMessage) -> Vec<Arc<ConnectionPool>> {
        let table = self.table();
        endpoints_for_message(self.router.as_ref(), msg, &table.routable)
            .into_iter()
            .filter_map(|endpoint| match table.hub_endpoints.get(&endpoint) {
                Some(hub_endpoint) => Some(hub_endpoint.pool().clone()),
                None => {
                    warn!(hub = %self.hub, endpoint = ?endpoint, "router returned an unknown endpoint - skipping");
                    None
                }
            })
            .collect()
    }

    pub async fn write(&self, msg: &ServiceMessage) -> anyhow::Result<()> {
        let pools = self.target_pools(msg);
        self.fan_out(&pools, |pool| pool.write(msg)).await
    }

    pub async fn write_partitioned(&self, partition_key: &str, msg: &ServiceMessage) -> anyhow::Result<()> {
        let pools = self.target_pools(msg);
        self.fan_out(&pools, |pool| pool.write_partitioned(partition_key, msg)).await
    }

    /// Sends the message to all target endpoints, and fails only if none of them took it
    async fn fan_out<'a, F, Fut>(&self, pools: &'a [Arc<ConnectionPool>], write: F) -> anyhow::Result<()>
    where
        F: Fn(&'a Arc<ConnectionPool>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + 'a,
    {
        match pools {
            [] => {
                debug!(hub = %self.hub, "no endpoint to write to");
                Ok(())
            }
            [pool] => write(pool).await,
            pools => {
                let results = join_all(pools.iter().map(&write)).await;

                let mut failed = 0;
                for (pool, result) in pools.iter().zip(results) {
                    if let Err(e) = result {
                        warn!(hub = %self.hub, endpoint = ?pool.endpoint(), "failed to write to endpoint: {}", e);
                        failed += 1;
                    }
                }
                if failed == pools.len() {
                    bail!(ServiceTransportError::AggregateEndpointFailure { failed, targeted: pools.len() });
                }
                Ok(())
            }
        }
    }

    /// Sends an ack-capable message to all target endpoints. Returns `true` as soon as any
    ///  endpoint acks with success, and `false` if the endpoints that answered reported that the
    ///  target was not found.
    pub async fn write_ackable(&self, msg: &ServiceMessage) -> anyhow::Result<bool> {
        let pools = self.target_pools(msg);
        if pools.is_empty() {
            bail!(ServiceTransportError::ServiceNotConnected);
        }

        let acks = pools.iter()
            .map(|pool| pool.write_ack(msg).boxed())
            .collect::<Vec<_>>();
        race_acks(acks).await
    }

    /// Creates a pool for a new endpoint and makes the endpoint available for negotiation once
    ///  the pool is ready. Messages are written to it right away. Returns `false` if the endpoint
    ///  was known already or did not become ready within the scale timeout; in the latter case
    ///  it stays in the container without being negotiable.
    pub async fn add_endpoint(&self, endpoint: ServiceEndpoint) -> bool {
        let hub_endpoint = self.update_table(|table| {
            if table.hub_endpoints.contains_key(&endpoint) {
                return None;
            }
            let hub_endpoint = Arc::new(HubServiceEndpoint::new(&self.hub, &endpoint, self.options.clone(), self.factory.clone(), self.dispatcher.clone()));
            table.hub_endpoints.insert(hub_endpoint.endpoint().clone(), hub_endpoint.clone());
            table.routable.push(hub_endpoint.endpoint().clone());
            Some(hub_endpoint)
        });
        let Some(hub_endpoint) = hub_endpoint else {
            debug!(hub = %self.hub, endpoint = ?endpoint, "endpoint exists already");
            return false;
        };

        info!(hub = %self.hub, endpoint = ?endpoint, "adding endpoint");
        if !self.started.load(Ordering::Acquire) {
            // started with the others
            self.publish_negotiable(&hub_endpoint);
            return true;
        }

        hub_endpoint.start();
        if !hub_endpoint.wait_for_scale_ready(self.options.scale_timeout).await {
            return false;
        }
        self.publish_negotiable(&hub_endpoint)
    }

    fn publish_negotiable(&self, hub_endpoint: &HubServiceEndpoint) -> bool {
        self.update_table(|table| {
            // it may have been removed in the meantime
            if !table.hub_endpoints.contains_key(hub_endpoint.endpoint()) {
                return false;
            }
            if !table.negotiable.contains(hub_endpoint.endpoint()) {
                table.negotiable.push(hub_endpoint.endpoint().clone());
            }
            true
        })
    }

    /// Takes an endpoint out of negotiation, waits for the service to report that it has no more
    ///  clients (bounded by the scale timeout), then stops writing to it and closes its pool.
    ///  Returns `false` if the endpoint was unknown or did not drain in time.
    pub async fn remove_endpoint(&self, endpoint: &ServiceEndpoint) -> bool {
        let hub_endpoint = self.update_table(|table| {
            let hub_endpoint = table.hub_endpoints.get(endpoint).cloned()?;
            table.negotiable.retain(|e| e != endpoint);
            Some(hub_endpoint)
        });
        let Some(hub_endpoint) = hub_endpoint else {
            debug!(hub = %self.hub, endpoint = ?endpoint, "removing unknown endpoint - ignoring");
            return false;
        };

        info!(hub = %self.hub, endpoint = ?endpoint, "removing endpoint, waiting for it to drain");
        let timeout = self.options.scale_timeout;
        let drained = tokio::time::timeout(timeout, hub_endpoint.pool().wait_for_drained()).await.is_ok();
        if !drained {
            warn!(hub = %self.hub, endpoint = ?endpoint, "endpoint did not drain within {:?}, removing it anyway", timeout);
        }

        self.update_table(|table| {
            table.hub_endpoints.remove(endpoint);
            table.routable.retain(|e| e != endpoint);
        });
        hub_endpoint.pool().stop();
        info!(hub = %self.hub, endpoint = ?endpoint, "endpoint removed");
        drained
    }

    /// Applies a changed endpoint configuration, adding and removing endpoints concurrently.
    ///  Endpoints are matched by their identity, so a changed access key alone is not a change.
    pub async fn reload(&self, endpoints: Vec<ServiceEndpoint>) -> anyhow::Result<()> {
        validate_endpoints(&endpoints)?;

        let table = self.table();
        let mut to_add: Vec<ServiceEndpoint> = Vec::new();
        for endpoint in endpoints.iter() {
            if !table.hub_endpoints.contains_key(endpoint) && !to_add.contains(endpoint) {
                to_add.push(endpoint.clone());
            }
        }
        let to_remove = table.hub_endpoints.keys()
            .filter(|e| !endpoints.contains(e))
            .cloned()
            .collect::<Vec<_>>();

        if to_add.is_empty() && to_remove.is_empty() {
            debug!(hub = %self.hub, "endpoint configuration is unchanged");
            return Ok(());
        }
        info!(hub = %self.hub, "reloading endpoints: adding {:?}, removing {:?}", to_add, to_remove);

        let adds = join_all(to_add.into_iter().map(|e| self.add_endpoint(e)));
        let removes = join_all(to_remove.iter().map(|e| self.remove_endpoint(e)));
        futures::join!(adds, removes);
        Ok(())
    }
}

/// Combines the acks of several endpoints for the same message: the first success wins, and the
///  result is an error only if no endpoint gave a definite answer
pub async fn race_acks(acks: Vec<BoxFuture<'_, anyhow::Result<AckStatus>>>) -> anyhow::Result<bool> {
    let targeted = acks.len();
    let mut pending = acks.into_iter().collect::<FuturesUnordered<_>>();

    let mut not_found = 0;
    let mut failed = 0;
    while let Some(result) = pending.next().await {
        match result {
            Ok(AckStatus::Ok) => return Ok(true),
            Ok(AckStatus::NotFound) => not_found += 1,
            Ok(AckStatus::Timeout) => failed += 1,
            Err(e) => {
                debug!("ack-capable write failed: {}", e);
                failed += 1;
            }
        }
    }

    if not_found > 0 {
        return Ok(false);
    }
    bail!(ServiceTransportError::AggregateEndpointFailure { failed, targeted })
}
