use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServiceOptions;
use crate::connection::ack_handler::AckHandler;
use crate::connection::backoff::ReconnectBackoff;
use crate::connection::keepalive::{ActivityTracker, SessionAbort};
use crate::connection::transport::{ConnectionFactory, ConnectionRequest, TransportReader, TransportWriter};
use crate::endpoint::service_endpoint::{EndpointMetrics, ServiceEndpoint};
use crate::error::ServiceTransportError;
use crate::protocol::codec::{Decoded, ServiceProtocol};
use crate::protocol::messages::*;

const READ_BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Notifications from a connection to the pool that owns it
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StatusChanged {
        connection_id: String,
        status: ConnectionStatus,
    },
    /// The connection's reconnect loop ended for good, either because it was stopped or because
    ///  it was an on-demand connection whose session ended
    Terminated {
        connection_id: String,
    },
    /// the service asks for an additional connection to the given target
    TargetRequested(String),
    EndpointActive(bool),
    Metrics(EndpointMetrics),
}

/// Identifies where an inbound message came from. It is passed to the dispatcher explicitly with
///  every message.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub connection_id: String,
    pub endpoint: ServiceEndpoint,
    pub hub: String,
}

/// Application side handling of client traffic that the service relays to this server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_open_connection(&self, ctx: &DispatchContext, msg: OpenConnectionData);
    async fn on_close_connection(&self, ctx: &DispatchContext, msg: CloseConnectionData);
    async fn on_connection_data(&self, ctx: &DispatchContext, msg: ConnectionPayloadData);
    async fn on_service_error(&self, ctx: &DispatchContext, msg: ServiceErrorData);
    async fn on_service_event(&self, ctx: &DispatchContext, msg: ServiceEventData);
}

/// The inbound messages that are handed to the [MessageDispatcher]
enum Dispatch {
    Open(OpenConnectionData),
    Close(CloseConnectionData),
    Data(ConnectionPayloadData),
    Error(ServiceErrorData),
    Event(ServiceEventData),
}

/// Everything a connection shares with the other connections of its pool
#[derive(Clone)]
pub struct ConnectionContext {
    pub hub: String,
    pub endpoint: ServiceEndpoint,
    pub options: Arc<ServiceOptions>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub ack_handler: Arc<AckHandler>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

struct Session {
    reader: Box<dyn TransportReader>,
    writer: Box<dyn TransportWriter>,
    /// bytes that arrived together with the handshake response
    read_buf: BytesMut,
}

/// A single persistent, multiplexed connection to a service endpoint. It reconnects with
///  exponential backoff until it is stopped; on-demand connections end with their first session.
pub struct ServiceConnection {
    id: String,
    connection_type: ConnectionType,
    target: Option<String>,
    ctx: ConnectionContext,
    protocol: ServiceProtocol,

    status: watch::Sender<ConnectionStatus>,
    stopped: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<Box<dyn TransportWriter>>>,
    activity: ActivityTracker,
    /// set by an inbound `ServiceError`, closes the outbound path until the next session
    fault: Mutex<Option<String>>,
    session: Mutex<Option<Arc<SessionAbort>>>,
    timeout_aborts: AtomicUsize,
    keepalive_in_flight: AtomicBool,
    offline_acked: watch::Sender<bool>,
}

impl ServiceConnection {
    pub fn new(ctx: ConnectionContext, connection_type: ConnectionType, target: Option<String>) -> Arc<ServiceConnection> {
        let protocol = ServiceProtocol::new(ctx.options.max_frame_size);
        Arc::new(ServiceConnection {
            id: uuid::Uuid::new_v4().to_string(),
            connection_type,
            target,
            ctx,
            protocol,
            status: watch::Sender::new(ConnectionStatus::Disconnected),
            stopped: watch::Sender::new(false),
            writer: Default::default(),
            activity: ActivityTracker::new(),
            fault: Default::default(),
            session: Default::default(),
            timeout_aborts: AtomicUsize::new(0),
            keepalive_in_flight: AtomicBool::new(false),
            offline_acked: watch::Sender::new(false),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.id
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.ctx.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn last_receive_age(&self) -> Duration {
        self.activity.since_last_receive()
    }

    /// number of sessions that were aborted because the service went silent
    pub fn timeout_abort_count(&self) -> usize {
        self.timeout_aborts.load(Ordering::Acquire)
    }

    pub async fn wait_for_connected(&self) {
        let mut status = self.status.subscribe();
        let _ = status.wait_for(|s| *s == ConnectionStatus::Connected).await;
    }

    async fn wait_stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|s| *s).await;
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.reconnect_loop().await;
        });
    }

    /// Stops the connection for good. The current session, if any, is closed.
    pub fn stop(&self) {
        if self.stopped.send_replace(true) {
            return;
        }
        debug!(connection_id = %self.id, "stopping service connection");
        if let Some(abort) = self.current_session() {
            abort.abort();
        }
    }

    /// Asks the service to move this connection's clients elsewhere and waits for its
    ///  acknowledgement. Returns `false` if the connection was not connected or the service did
    ///  not acknowledge in time.
    pub async fn offline(&self, timeout: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }

        self.offline_acked.send_replace(false);
        let mut acked = self.offline_acked.subscribe();

        if let Err(e) = self.write(&ServiceMessage::Ping(PingData::offline_request())).await {
            debug!(connection_id = %self.id, "failed to send offline request: {}", e);
            return false;
        }

        let result = tokio::time::timeout(timeout, acked.wait_for(|a| *a)).await;
        matches!(result, Ok(Ok(_)))
    }

    pub async fn write(&self, msg: &ServiceMessage) -> anyhow::Result<()> {
        if let Some(fault) = self.fault() {
            bail!(ServiceTransportError::ServiceErrorFault(fault));
        }

        let mut buf = BytesMut::new();
        self.protocol.write_message(msg, &mut buf)?;

        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            bail!(ServiceTransportError::ServiceConnectionNotActive);
        };

        // a stalled transport must not outlive its session
        let result = match self.current_session() {
            Some(abort) => select! {
                r = w.write(buf.freeze()) => r,
                _ = abort.aborted() => Err(anyhow!("session was aborted during the write")),
            },
            None => w.write(buf.freeze()).await,
        };
        if let Err(e) = result {
            warn!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "write failed, aborting the session: {}", e);
            writer.take();
            if let Some(abort) = self.current_session() {
                abort.abort();
            }
            bail!(ServiceTransportError::ServiceConnectionNotActive);
        }

        self.activity.on_send();
        trace!(connection_id = %self.id, "sent {:?}", msg.message_type());
        Ok(())
    }

    fn fault(&self) -> Option<String> {
        self.fault.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_fault(&self, fault: Option<String>) {
        *self.fault.lock().unwrap_or_else(|e| e.into_inner()) = fault;
    }

    fn current_session(&self) -> Option<Arc<SessionAbort>> {
        self.session.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_current_session(&self, session: Option<Arc<SessionAbort>>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "{:?} -> {:?}", previous, status);
            self.emit(ConnectionEvent::StatusChanged {
                connection_id: self.id.clone(),
                status,
            });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.ctx.events.send(event).is_err() {
            trace!(connection_id = %self.id, "pool is gone, dropping connection event");
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut backoff = ReconnectBackoff::new();

        while !self.is_stopped() {
            self.set_status(ConnectionStatus::Connecting);

            let session = select! {
                s = self.connect_and_handshake() => s,
                _ = self.wait_stopped() => break,
            };

            match session {
                Ok(session) => {
                    backoff.reset();
                    self.run_session(session).await;
                }
                Err(e) => {
                    warn!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "failed to connect to the service: {}", e);
                }
            }
            self.set_status(ConnectionStatus::Disconnected);

            if self.connection_type == ConnectionType::OnDemand {
                debug!(connection_id = %self.id, "on-demand connection ended, not reconnecting");
                break;
            }
            if self.is_stopped() {
                break;
            }

            let delay = backoff.next_delay();
            debug!(connection_id = %self.id, "reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            select! {
                _ = sleep(delay) => {}
                _ = self.wait_stopped() => {}
            }
        }

        self.stopped.send_replace(true);
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(ConnectionEvent::Terminated {
            connection_id: self.id.clone(),
        });
        info!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "service connection terminated");
    }

    async fn connect_and_handshake(&self) -> anyhow::Result<Session> {
        let request = ConnectionRequest {
            endpoint: self.ctx.endpoint.clone(),
            hub: self.ctx.hub.clone(),
            connection_id: self.id.clone(),
            server_name: self.ctx.options.server_name.clone(),
            target: self.target.clone(),
        };

        let handshake = self.handshake(&request);

        if self.ctx.options.debugger_attached {
            return handshake.await;
        }
        match tokio::time::timeout(self.ctx.options.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => bail!(ServiceTransportError::Handshake(format!("no handshake response within {:?}", self.ctx.options.handshake_timeout))),
        }
    }

    async fn handshake(&self, request: &ConnectionRequest) -> anyhow::Result<Session> {
        let (mut reader, mut writer) = self.ctx.factory.connect(request).await?;

        let mut buf = BytesMut::new();
        self.protocol.write_message(&ServiceMessage::HandshakeRequest(HandshakeRequestData {
            version: PROTOCOL_VERSION,
            connection_type: self.connection_type,
            target: self.target.clone(),
            migration_level: self.ctx.options.migration_level,
        }), &mut buf)?;
        writer.write(buf.freeze()).await?;

        let mut read_buf = BytesMut::with_capacity(READ_BUF_SIZE);
        let response = loop {
            if let Some(msg) = self.protocol.try_parse_message(&mut read_buf)? {
                break msg;
            }
            if reader.read(&mut read_buf).await? == 0 {
                bail!(ServiceTransportError::Handshake("connection closed during the handshake".to_string()));
            }
        };

        match response {
            ServiceMessage::HandshakeResponse(response) if response.error_message.is_empty() => {
                info!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, service_connection_id = ?response.connection_id, "connected to the service");
                Ok(Session {
                    reader,
                    writer,
                    read_buf,
                })
            }
            ServiceMessage::HandshakeResponse(response) => {
                let _ = writer.close().await;
                bail!(ServiceTransportError::Handshake(response.error_message))
            }
            other => {
                let _ = writer.close().await;
                bail!(ServiceTransportError::Handshake(format!("expected a handshake response, received {:?}", other.message_type())))
            }
        }
    }

    async fn run_session(self: &Arc<Self>, session: Session) {
        let Session { mut reader, writer, mut read_buf } = session;

        let abort = Arc::new(SessionAbort::new());
        self.set_current_session(Some(abort.clone()));
        *self.writer.lock().await = Some(writer);
        self.set_fault(None);
        self.activity.reset();
        self.set_status(ConnectionStatus::Connected);

        let (dispatch_send, dispatch_recv) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().dispatch_loop(dispatch_recv));
        let watchdog = tokio::spawn(self.clone().watchdog(abort.clone()));

        let result = select! {
            r = self.read_loop(&mut reader, &mut read_buf, &dispatch_send) => r,
            _ = abort.aborted() => Ok(()),
            _ = self.wait_stopped() => Ok(()),
        };
        if let Err(e) = result {
            warn!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "connection to the service failed: {}", e);
        }

        abort.abort();
        watchdog.abort();
        self.set_current_session(None);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                debug!(connection_id = %self.id, "error closing the transport: {}", e);
            }
        }
    }

    async fn read_loop(self: &Arc<Self>, reader: &mut Box<dyn TransportReader>, buf: &mut BytesMut, dispatch: &mpsc::UnboundedSender<Dispatch>) -> anyhow::Result<()> {
        self.process_frames(buf, dispatch)?;

        loop {
            buf.reserve(READ_BUF_SIZE);
            let n = reader.read(buf).await?;
            if n == 0 {
                info!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "the service closed the connection");
                return Ok(());
            }
            self.activity.on_receive();
            self.keepalive_if_due();
            self.process_frames(buf, dispatch)?;
        }
    }

    fn process_frames(&self, buf: &mut BytesMut, dispatch: &mpsc::UnboundedSender<Dispatch>) -> anyhow::Result<()> {
        // errors in the framing itself are fatal for the session, errors in a single message are not
        while let Some(frame) = self.protocol.try_parse_frame(buf)? {
            match self.protocol.parse_message(&frame) {
                Ok(Decoded::Message(msg)) => self.on_message(msg, dispatch),
                Ok(Decoded::Unknown(tag)) => debug!(connection_id = %self.id, "skipping message of unknown type {}", tag),
                Err(e) => warn!(connection_id = %self.id, "received a message that could not be parsed - skipping: {}", e),
            }
        }
        Ok(())
    }

    fn on_message(&self, msg: ServiceMessage, dispatch: &mpsc::UnboundedSender<Dispatch>) {
        let to_dispatch = match msg {
            ServiceMessage::Ack(ack) => {
                self.ctx.ack_handler.trigger_ack(ack.ack_id, ack.status);
                return;
            }
            ServiceMessage::Ping(ping) => {
                self.on_ping(ping);
                return;
            }
            ServiceMessage::ServiceError(e) => {
                warn!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "the service reported an error, closing the outbound path: {}", e.error_message);
                self.set_fault(Some(e.error_message.clone()));
                Dispatch::Error(e)
            }
            ServiceMessage::OpenConnection(d) => Dispatch::Open(d),
            ServiceMessage::CloseConnection(d) => Dispatch::Close(d),
            ServiceMessage::ConnectionData(d) => Dispatch::Data(d),
            ServiceMessage::ServiceEvent(d) => Dispatch::Event(d),

            ServiceMessage::HandshakeRequest(_)
            | ServiceMessage::HandshakeResponse(_)
            | ServiceMessage::MultiConnectionData(_)
            | ServiceMessage::UserData(_)
            | ServiceMessage::MultiUserData(_)
            | ServiceMessage::BroadcastData(_)
            | ServiceMessage::JoinGroup(_)
            | ServiceMessage::LeaveGroup(_)
            | ServiceMessage::GroupBroadcastData(_)
            | ServiceMessage::MultiGroupBroadcastData(_)
            | ServiceMessage::UserJoinGroup(_)
            | ServiceMessage::UserLeaveGroup(_)
            | ServiceMessage::JoinGroupWithAck(_)
            | ServiceMessage::LeaveGroupWithAck(_)
            | ServiceMessage::CheckUserInGroupWithAck(_)
            | ServiceMessage::CheckGroupExistenceWithAck(_)
            | ServiceMessage::CheckConnectionExistenceWithAck(_)
            | ServiceMessage::CheckUserExistenceWithAck(_)
            | ServiceMessage::UserJoinGroupWithAck(_)
            | ServiceMessage::UserLeaveGroupWithAck(_) => {
                warn!(connection_id = %self.id, "unexpected message of type {:?} from the service - ignoring", msg.message_type());
                return;
            }
        };

        if dispatch.send(to_dispatch).is_err() {
            error!(connection_id = %self.id, "dispatcher task is gone, dropping inbound message");
        }
    }

    fn on_ping(&self, ping: PingData) {
        trace!(connection_id = %self.id, "ping {:?}", ping.messages);

        if ping.is_offline_ack() {
            self.offline_acked.send_replace(true);
        }
        if let Some(target) = ping.target() {
            self.emit(ConnectionEvent::TargetRequested(target.to_string()));
        }
        if let Some(active) = ping.status() {
            self.emit(ConnectionEvent::EndpointActive(active));
        }
        if let Some(metrics) = ping.metrics(&self.ctx.endpoint.metrics()) {
            self.emit(ConnectionEvent::Metrics(metrics));
        }
    }

    /// Runs handlers one message at a time, so a connection's messages reach the application in
    ///  the order they were received, without the read loop waiting for the handlers
    async fn dispatch_loop(self: Arc<Self>, mut recv: mpsc::UnboundedReceiver<Dispatch>) {
        let ctx = DispatchContext {
            connection_id: self.id.clone(),
            endpoint: self.ctx.endpoint.clone(),
            hub: self.ctx.hub.clone(),
        };
        let dispatcher = self.ctx.dispatcher.clone();

        while let Some(msg) = recv.recv().await {
            match msg {
                Dispatch::Open(d) => dispatcher.on_open_connection(&ctx, d).await,
                Dispatch::Close(d) => dispatcher.on_close_connection(&ctx, d).await,
                Dispatch::Data(d) => dispatcher.on_connection_data(&ctx, d).await,
                Dispatch::Error(d) => dispatcher.on_service_error(&ctx, d).await,
                Dispatch::Event(d) => dispatcher.on_service_event(&ctx, d).await,
            }
        }
    }

    async fn watchdog(self: Arc<Self>, abort: Arc<SessionAbort>) {
        let interval = self.ctx.options.keep_alive_interval;
        let service_timeout = self.ctx.options.service_timeout;

        loop {
            sleep(interval).await;
            if abort.is_aborted() {
                return;
            }

            let silence = self.activity.since_last_receive();
            if silence >= service_timeout {
                if abort.abort() {
                    self.timeout_aborts.fetch_add(1, Ordering::AcqRel);
                    warn!(connection_id = %self.id, endpoint = ?self.ctx.endpoint, "{}", ServiceTransportError::ServiceTimeout(silence));
                }
                return;
            }

            // spawned, so a stalled write cannot hold up the timeout check
            self.keepalive_if_due();
        }
    }

    fn keepalive_if_due(self: &Arc<Self>) {
        if self.activity.since_last_send() < self.ctx.options.keep_alive_interval {
            return;
        }
        if self.keepalive_in_flight.load(Ordering::Acquire) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.send_keepalive().await;
        });
    }

    /// at most one keepalive is in flight at a time
    async fn send_keepalive(&self) {
        if self.keepalive_in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.write(&ServiceMessage::Ping(PingData::keepalive())).await {
            debug!(connection_id = %self.id, "failed to send keepalive: {}", e);
        }
        self.keepalive_in_flight.store(false, Ordering::Release);
    }
}
