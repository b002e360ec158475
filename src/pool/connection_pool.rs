use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::bail;
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ServiceOptions;
use crate::connection::ack_handler::AckHandler;
use crate::connection::service_connection::{ConnectionContext, ConnectionEvent, MessageDispatcher, ServiceConnection};
use crate::connection::transport::ConnectionFactory;
use crate::endpoint::service_endpoint::{EndpointType, ServiceEndpoint};
use crate::error::ServiceTransportError;
use crate::pool::selection::{partition_index, write_with_failover};
use crate::protocol::messages::{AckStatus, ConnectionType, ServiceMessage};
use crate::util::random::{random_index, RngRandom};

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

type Connections = Arc<Vec<Arc<ServiceConnection>>>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PoolKind {
    /// connections can carry client connections, and the service may ask for on-demand connections
    Strong,
    /// connections only relay messages for clients that are connected through other endpoints
    Weak,
}

impl PoolKind {
    pub fn for_endpoint(endpoint: &ServiceEndpoint) -> PoolKind {
        match endpoint.endpoint_type() {
            EndpointType::Primary => PoolKind::Strong,
            EndpointType::Secondary => PoolKind::Weak,
        }
    }

    fn connection_type(&self) -> ConnectionType {
        match self {
            PoolKind::Strong => ConnectionType::Default,
            PoolKind::Weak => ConnectionType::Weak,
        }
    }
}

/// The connections of one hub to one endpoint: a fixed number of connections that are kept
///  connected, plus on-demand connections that the service asks for.
///
/// The connection list is replaced as a whole whenever it changes, so writers work on a
///  consistent snapshot without holding a lock across awaits. The fixed connections always come
///  first in the list.
pub struct ConnectionPool {
    hub: String,
    endpoint: ServiceEndpoint,
    kind: PoolKind,
    ctx: ConnectionContext,
    fixed_count: usize,

    connections: RwLock<Connections>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    ready: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        hub: &str,
        endpoint: ServiceEndpoint,
        options: Arc<ServiceOptions>,
        factory: Arc<dyn ConnectionFactory>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Arc<ConnectionPool> {
        let (events_send, events_recv) = mpsc::unbounded_channel();
        let kind = PoolKind::for_endpoint(&endpoint);

        let ctx = ConnectionContext {
            hub: hub.to_string(),
            endpoint: endpoint.clone(),
            ack_handler: Arc::new(AckHandler::new(options.ack_timeout)),
            options: options.clone(),
            factory,
            dispatcher,
            events: events_send,
        };

        let connections = (0..options.connection_count)
            .map(|_| ServiceConnection::new(ctx.clone(), kind.connection_type(), None))
            .collect::<Vec<_>>();

        Arc::new(ConnectionPool {
            hub: hub.to_string(),
            endpoint,
            kind,
            ctx,
            fixed_count: options.connection_count,
            connections: RwLock::new(Arc::new(connections)),
            events: Mutex::new(Some(events_recv)),
            event_loop: Default::default(),
            ready: watch::Sender::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn hub(&self) -> &str {
        &self.hub
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// a snapshot of all connections, fixed connections first
    pub fn connections(&self) -> Connections {
        self.connections.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn start(self: &Arc<Self>) {
        let Some(events) = self.events.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!(hub = %self.hub, endpoint = ?self.endpoint, "connection pool was already started");
            return;
        };
        debug!(hub = %self.hub, endpoint = ?self.endpoint, "starting {} connections", self.fixed_count);

        let handle = tokio::spawn(Self::event_loop(Arc::downgrade(self), events));
        *self.event_loop.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        for conn in self.connections().iter() {
            conn.start();
        }
    }

    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(hub = %self.hub, endpoint = ?self.endpoint, "stopping connection pool");

        for conn in self.connections().iter() {
            conn.stop();
        }
        if let Some(handle) = self.event_loop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.endpoint.set_online(false);
    }

    /// Asks the service to move clients away from all connections, waiting at most `timeout` for
    ///  each connection's acknowledgement. Returns the number of connections that acknowledged.
    pub async fn offline(&self, timeout: Duration) -> usize {
        let connections = self.connections();
        let acked = join_all(connections.iter().map(|c| c.offline(timeout)))
            .await
            .into_iter()
            .filter(|acked| *acked)
            .count();
        info!(hub = %self.hub, endpoint = ?self.endpoint, "{} of {} connections acknowledged going offline", acked, connections.len());
        acked
    }

    /// at least one connection is connected
    pub fn is_online(&self) -> bool {
        self.connections().iter().any(|c| c.is_connected())
    }

    /// Resolves once all fixed connections were connected at the same time. This happens once in
    ///  the pool's lifetime, later disconnects do not reset it.
    pub async fn wait_for_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|r| *r).await;
    }

    /// Resolves once the service reports that it routes no more clients to this endpoint, or once
    ///  all connections are stopped
    pub async fn wait_for_drained(&self) {
        loop {
            if !self.endpoint.is_active() {
                debug!(hub = %self.hub, endpoint = ?self.endpoint, "endpoint reported inactive");
                return;
            }
            if self.connections().iter().all(|c| c.is_stopped()) {
                debug!(hub = %self.hub, endpoint = ?self.endpoint, "all connections are stopped");
                return;
            }
            sleep(DRAIN_CHECK_INTERVAL).await;
        }
    }

    pub async fn write(&self, msg: &ServiceMessage) -> anyhow::Result<()> {
        let connections = self.connections();
        let fixed = &connections[..self.fixed_count.min(connections.len())];
        let Some(start) = random_index::<RngRandom>(fixed.len()) else {
            bail!(ServiceTransportError::ServiceConnectionNotActive);
        };
        write_with_failover(fixed, start, msg).await?;
        Ok(())
    }

    /// Messages with the same partition key go through the same connection as long as it stays
    ///  connected, which keeps them in order
    pub async fn write_partitioned(&self, partition_key: &str, msg: &ServiceMessage) -> anyhow::Result<()> {
        let connections = self.connections();
        let fixed = &connections[..self.fixed_count.min(connections.len())];
        if fixed.is_empty() {
            bail!(ServiceTransportError::ServiceConnectionNotActive);
        }

        let start = partition_index(partition_key, fixed.len());
        write_with_failover(fixed, start, msg).await?;
        Ok(())
    }

    /// Sends an ack-capable message with a freshly allocated ack id and waits for the service's
    ///  ack, which may arrive on any connection of the pool
    pub async fn write_ack(&self, msg: &ServiceMessage) -> anyhow::Result<AckStatus> {
        let pending = self.ctx.ack_handler.register();

        let mut msg = msg.clone();
        if !msg.set_ack_id(pending.ack_id()) {
            bail!("messages of type {:?} can not be acked", msg.message_type());
        }

        self.write(&msg).await?;
        Ok(pending.wait().await)
    }

    /// The service asks for a connection that is routed to a specific target, e.g. for a client
    ///  that is migrated to this server. Only strong pools carry client connections.
    pub fn on_target_ping(&self, target: &str) {
        if self.kind == PoolKind::Weak {
            debug!(hub = %self.hub, endpoint = ?self.endpoint, "ignoring target request {:?} on a weak pool", target);
            return;
        }
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let conn = {
            let mut connections = self.connections.write()
                .unwrap_or_else(|e| e.into_inner());

            if connections.iter().any(|c| c.target() == Some(target) && !c.is_stopped()) {
                debug!(hub = %self.hub, endpoint = ?self.endpoint, "there is an on-demand connection for target {:?} already", target);
                return;
            }

            let conn = ServiceConnection::new(self.ctx.clone(), ConnectionType::OnDemand, Some(target.to_string()));
            let mut updated = connections.iter().cloned().collect::<Vec<_>>();
            updated.push(conn.clone());
            *connections = Arc::new(updated);
            conn
        };

        info!(hub = %self.hub, endpoint = ?self.endpoint, connection_id = %conn.connection_id(), "opening on-demand connection for target {:?}", target);
        conn.start();
    }

    fn remove_on_demand(&self, connection_id: &str) {
        let mut connections = self.connections.write()
            .unwrap_or_else(|e| e.into_inner());

        let updated = connections.iter()
            .filter(|c| !(c.connection_type() == ConnectionType::OnDemand && c.connection_id() == connection_id))
            .cloned()
            .collect::<Vec<_>>();

        if updated.len() != connections.len() {
            debug!(hub = %self.hub, connection_id, "removing terminated on-demand connection");
            *connections = Arc::new(updated);
        }
    }

    async fn event_loop(pool: Weak<ConnectionPool>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            pool.on_event(event);
        }
    }

    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged { .. } => {
                self.update_state();
            }
            ConnectionEvent::Terminated { connection_id } => {
                self.remove_on_demand(&connection_id);
                self.update_state();
            }
            ConnectionEvent::TargetRequested(target) => {
                self.on_target_ping(&target);
            }
            ConnectionEvent::EndpointActive(active) => {
                if self.endpoint.is_active() != active {
                    info!(hub = %self.hub, endpoint = ?self.endpoint, "service reports endpoint as {}", if active { "active" } else { "inactive" });
                }
                self.endpoint.set_active(active);
            }
            ConnectionEvent::Metrics(metrics) => {
                self.endpoint.update_metrics(metrics);
            }
        }
    }

    fn update_state(&self) {
        let connections = self.connections();

        let online = !self.stopped.load(Ordering::Acquire) && connections.iter().any(|c| c.is_connected());
        if self.endpoint.is_online() != online {
            info!(hub = %self.hub, endpoint = ?self.endpoint, "endpoint is {}", if online { "online" } else { "offline" });
        }
        self.endpoint.set_online(online);

        if !*self.ready.borrow() && connections.iter().take(self.fixed_count).all(|c| c.is_connected()) {
            debug!(hub = %self.hub, endpoint = ?self.endpoint, "all connections are connected");
            self.ready.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::timeout;

    use crate::connection::service_connection::MockMessageDispatcher;
    use crate::connection::test_transport::*;
    use crate::protocol::messages::*;
    use super::*;

    fn pool(endpoint: ServiceEndpoint, connection_count: usize, factory: Arc<MemoryConnectionFactory>) -> Arc<ConnectionPool> {
        let options = test_options(vec![endpoint.clone()], connection_count);
        ConnectionPool::new("chat", endpoint, options, factory, Arc::new(MockMessageDispatcher::new()))
    }

    fn user_data(user_id: &str, payload: &'static [u8]) -> ServiceMessage {
        ServiceMessage::UserData(UserPayloadData {
            user_id: user_id.to_string(),
            payloads: vec![("json".to_string(), Bytes::from_static(payload))],
        })
    }

    fn join_with_ack() -> ServiceMessage {
        ServiceMessage::JoinGroupWithAck(GroupMembershipAckData {
            connection_id: "client-1".to_string(),
            group: "g".to_string(),
            ack_id: 0,
        })
    }

    fn ping(kv: &[&str]) -> ServiceMessage {
        ServiceMessage::Ping(PingData { messages: kv.iter().map(|s| s.to_string()).collect() })
    }

    #[tokio::test]
    async fn test_ready_and_write() {
        let (factory, accepted) = MemoryConnectionFactory::new();
        let mut received = spawn_auto_relay(accepted, AckStatus::Ok, Duration::ZERO);
        let endpoint = test_endpoint("a", "a.example");
        let pool = pool(endpoint.clone(), 3, factory);
        assert_eq!(pool.kind(), PoolKind::Strong);
        assert!(!pool.is_online());

        pool.start();
        pool.wait_for_ready().await;
        assert!(pool.is_online());
        assert!(endpoint.is_online());
        assert_eq!(pool.connections().len(), 3);

        let msg = user_data("u1", b"1");
        pool.write(&msg).await.unwrap();
        assert_eq!(received.recv().await.unwrap().1, msg);

        pool.write_partitioned("u1", &user_data("u1", b"2")).await.unwrap();
        let (first_connection, _) = received.recv().await.unwrap();
        pool.write_partitioned("u1", &user_data("u1", b"3")).await.unwrap();
        let (second_connection, msg) = received.recv().await.unwrap();
        assert_eq!(msg, user_data("u1", b"3"));
        assert_eq!(first_connection, second_connection);

        pool.stop();
        assert!(!endpoint.is_online());
    }

    #[tokio::test]
    async fn test_write_before_start() {
        let (factory, _accepted) = MemoryConnectionFactory::new();
        let pool = pool(test_endpoint("a", "a.example"), 2, factory);

        let err = pool.write(&user_data("u1", b"1")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ServiceTransportError>(), Some(ServiceTransportError::ServiceConnectionNotActive)));
    }

    #[tokio::test]
    async fn test_write_ack() {
        let (factory, accepted) = MemoryConnectionFactory::new();
        let mut received = spawn_auto_relay(accepted, AckStatus::NotFound, Duration::ZERO);
        let pool = pool(test_endpoint("a", "a.example"), 2, factory);
        pool.start();
        pool.wait_for_ready().await;

        assert_eq!(pool.write_ack(&join_with_ack()).await.unwrap(), AckStatus::NotFound);
        let (_, msg) = received.recv().await.unwrap();
        assert!(msg.ack_id().unwrap() > 0);

        assert!(pool.write_ack(&user_data("u1", b"1")).await.is_err());
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_ack_timeout() {
        let (factory, accepted) = MemoryConnectionFactory::new();
        let _received = spawn_auto_relay(accepted, AckStatus::Ok, Duration::from_secs(20));
        let pool = pool(test_endpoint("a", "a.example"), 1, factory);
        pool.start();
        pool.wait_for_ready().await;

        let started = tokio::time::Instant::now();
        assert_eq!(pool.write_ack(&join_with_ack()).await.unwrap(), AckStatus::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_ping_opens_on_demand_connection() {
        let (factory, mut accepted) = MemoryConnectionFactory::new();
        let pool = pool(test_endpoint("a", "a.example"), 2, factory);
        pool.start();

        let mut r1 = accepted.recv().await.unwrap();
        r1.accept_handshake().await;
        let mut r2 = accepted.recv().await.unwrap();
        r2.accept_handshake().await;
        pool.wait_for_ready().await;

        r1.send_message(ping(&["target", "t1"]));
        let mut on_demand = accepted.recv().await.unwrap();
        assert_eq!(on_demand.request.target.as_deref(), Some("t1"));
        let handshake = on_demand.accept_handshake().await;
        assert_eq!(handshake.connection_type, ConnectionType::OnDemand);
        assert_eq!(pool.connections().len(), 3);

        // a second request for the same target reuses the connection
        r2.send_message(ping(&["target", "t1"]));
        sleep(Duration::from_millis(100)).await;
        assert!(accepted.try_recv().is_err());
        assert_eq!(pool.connections().len(), 3);

        on_demand.close();
        for _ in 0..100 {
            if pool.connections().len() == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.connections().len(), 2);
        assert!(pool.connections().iter().all(|c| c.connection_type() == ConnectionType::Default));
        assert!(accepted.try_recv().is_err());
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_weak_pool_ignores_target_ping() {
        let (factory, mut accepted) = MemoryConnectionFactory::new();
        let pool = pool(test_endpoint("b:secondary", "b.example"), 1, factory);
        assert_eq!(pool.kind(), PoolKind::Weak);
        pool.start();

        let mut relay = accepted.recv().await.unwrap();
        let handshake = relay.accept_handshake().await;
        assert_eq!(handshake.connection_type, ConnectionType::Weak);
        pool.wait_for_ready().await;

        relay.send_message(ping(&["target", "t1"]));
        sleep(Duration::from_millis(100)).await;
        assert!(accepted.try_recv().is_err());
        assert_eq!(pool.connections().len(), 1);
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_by_status_ping() {
        let (factory, mut accepted) = MemoryConnectionFactory::new();
        let endpoint = test_endpoint("a", "a.example");
        let pool = pool(endpoint.clone(), 1, factory);
        pool.start();

        let mut relay = accepted.recv().await.unwrap();
        relay.accept_handshake().await;
        pool.wait_for_ready().await;

        assert!(timeout(Duration::from_secs(2), pool.wait_for_drained()).await.is_err());

        relay.send_message(ping(&["status", "0", "clientcount", "0", "capacity", "1000"]));
        timeout(Duration::from_secs(5), pool.wait_for_drained()).await.unwrap();
        assert!(!endpoint.is_active());
        assert_eq!(endpoint.metrics().connection_capacity, 1000);
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_when_stopped() {
        let (factory, _accepted) = MemoryConnectionFactory::new();
        let pool = pool(test_endpoint("a", "a.example"), 2, factory);
        pool.start();
        pool.stop();

        timeout(Duration::from_secs(5), pool.wait_for_drained()).await.unwrap();
    }

    #[tokio::test]
    async fn test_offline() {
        let (factory, accepted) = MemoryConnectionFactory::new();
        let _received = spawn_auto_relay(accepted, AckStatus::Ok, Duration::ZERO);
        let pool = pool(test_endpoint("a", "a.example"), 2, factory);
        pool.start();
        pool.wait_for_ready().await;

        assert_eq!(pool.offline(Duration::from_secs(5)).await, 2);
        pool.stop();
    }
}
