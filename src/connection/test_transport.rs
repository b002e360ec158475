//! In-memory transport for tests. The factory hands the service side of every connection to the
//!  test as a [RelaySide], which plays the role of the service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::config::ServiceOptions;
use crate::connection::ping::{KEY_OFFLINE, OFFLINE_ACK, OFFLINE_REQUEST};
use crate::connection::transport::{ConnectionFactory, ConnectionRequest, TransportReader, TransportWriter};
use crate::endpoint::service_endpoint::ServiceEndpoint;
use crate::protocol::codec::ServiceProtocol;
use crate::protocol::messages::*;

pub fn test_endpoint(key: &str, host: &str) -> ServiceEndpoint {
    ServiceEndpoint::from_config_entry(key, &format!("Endpoint=https://{};AccessKey=abc;Version=1.0", host)).unwrap()
}

pub fn test_options(endpoints: Vec<ServiceEndpoint>, connection_count: usize) -> Arc<ServiceOptions> {
    let mut options = ServiceOptions::new(endpoints);
    options.connection_count = connection_count;
    options.server_name = "test-server".to_string();
    Arc::new(options)
}

pub struct MemoryConnectionFactory {
    accepted: mpsc::UnboundedSender<RelaySide>,
    /// per connection, writes after this many never complete
    stall_after_writes: Option<usize>,
}

impl MemoryConnectionFactory {
    pub fn new() -> (Arc<MemoryConnectionFactory>, mpsc::UnboundedReceiver<RelaySide>) {
        let (send, recv) = mpsc::unbounded_channel();
        (Arc::new(MemoryConnectionFactory { accepted: send, stall_after_writes: None }), recv)
    }

    /// a transport whose send side hangs like a half-open TCP connection with a full send buffer
    pub fn new_stalling(stall_after_writes: usize) -> (Arc<MemoryConnectionFactory>, mpsc::UnboundedReceiver<RelaySide>) {
        let (send, recv) = mpsc::unbounded_channel();
        (Arc::new(MemoryConnectionFactory { accepted: send, stall_after_writes: Some(stall_after_writes) }), recv)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn connect(&self, request: &ConnectionRequest) -> anyhow::Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
        let (to_relay_send, to_relay_recv) = mpsc::unbounded_channel();
        let (to_server_send, to_server_recv) = mpsc::unbounded_channel();

        let relay = RelaySide {
            request: request.clone(),
            recv: to_relay_recv,
            handle: RelayHandle {
                send: Some(to_server_send),
                protocol: ServiceProtocol::new(1024 * 1024),
            },
            buf: BytesMut::new(),
        };
        self.accepted.send(relay)
            .map_err(|_| anyhow!("connection refused"))?;

        Ok((
            Box::new(MemoryReader { recv: to_server_recv }),
            Box::new(MemoryWriter { send: Some(to_relay_send), remaining_writes: self.stall_after_writes }),
        ))
    }
}

struct MemoryReader {
    recv: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn read(&mut self, buf: &mut BytesMut) -> anyhow::Result<usize> {
        match self.recv.recv().await {
            Some(data) => {
                buf.extend_from_slice(&data);
                Ok(data.len())
            }
            None => Ok(0),
        }
    }
}

struct MemoryWriter {
    send: Option<mpsc::UnboundedSender<Bytes>>,
    remaining_writes: Option<usize>,
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn write(&mut self, data: Bytes) -> anyhow::Result<()> {
        match &mut self.remaining_writes {
            Some(0) => std::future::pending::<()>().await,
            Some(n) => *n -= 1,
            None => {}
        }
        self.send.as_ref()
            .ok_or_else(|| anyhow!("transport is closed"))?
            .send(data)
            .map_err(|_| anyhow!("connection reset by the service"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.send = None;
        Ok(())
    }
}

/// Sends messages to the application server. Clones share the connection.
#[derive(Clone)]
pub struct RelayHandle {
    send: Option<mpsc::UnboundedSender<Bytes>>,
    protocol: ServiceProtocol,
}

impl RelayHandle {
    pub fn send_message(&self, msg: ServiceMessage) {
        let mut buf = BytesMut::new();
        self.protocol.write_message(&msg, &mut buf).unwrap();
        if let Some(send) = &self.send {
            let _ = send.send(buf.freeze());
        }
    }

    pub fn send_raw(&self, data: &[u8]) {
        if let Some(send) = &self.send {
            let _ = send.send(Bytes::copy_from_slice(data));
        }
    }
}

/// The service's end of an in-memory connection
pub struct RelaySide {
    pub request: ConnectionRequest,
    recv: mpsc::UnboundedReceiver<Bytes>,
    handle: RelayHandle,
    buf: BytesMut,
}

impl RelaySide {
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    pub fn send_message(&self, msg: ServiceMessage) {
        self.handle.send_message(msg);
    }

    /// `None` once the application server closed the connection
    pub async fn recv_message(&mut self) -> Option<ServiceMessage> {
        loop {
            if let Some(msg) = self.handle.protocol.try_parse_message(&mut self.buf).unwrap() {
                return Some(msg);
            }
            let data = self.recv.recv().await?;
            self.buf.extend_from_slice(&data);
        }
    }

    /// skips keepalive pings
    pub async fn recv_non_keepalive(&mut self) -> Option<ServiceMessage> {
        loop {
            match self.recv_message().await? {
                ServiceMessage::Ping(ping) if ping.messages.is_empty() => continue,
                msg => return Some(msg),
            }
        }
    }

    pub async fn accept_handshake(&mut self) -> HandshakeRequestData {
        match self.recv_message().await {
            Some(ServiceMessage::HandshakeRequest(request)) => {
                self.send_message(ServiceMessage::HandshakeResponse(HandshakeResponseData {
                    error_message: String::new(),
                    connection_id: Some(format!("svc-{}", self.request.connection_id)),
                }));
                request
            }
            other => panic!("expected a handshake request, got {:?}", other),
        }
    }

    pub async fn reject_handshake(&mut self, error: &str) {
        match self.recv_message().await {
            Some(ServiceMessage::HandshakeRequest(_)) => {
                self.send_message(ServiceMessage::HandshakeResponse(HandshakeResponseData {
                    error_message: error.to_string(),
                    connection_id: None,
                }));
            }
            other => panic!("expected a handshake request, got {:?}", other),
        }
    }

    /// closes the service's side of the connection
    pub fn close(&mut self) {
        self.handle.send = None;
    }
}

/// A service that accepts every connection, answers keepalives and offline requests, and acks
///  ack-capable messages with the given status after the given delay. Everything else it receives
///  is reported as `(connection id, message)`.
pub fn spawn_auto_relay(mut accepted: mpsc::UnboundedReceiver<RelaySide>, ack_status: AckStatus, ack_delay: Duration) -> mpsc::UnboundedReceiver<(String, ServiceMessage)> {
    let (received_send, received_recv) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(mut relay) = accepted.recv().await {
            let received_send = received_send.clone();
            tokio::spawn(async move {
                relay.accept_handshake().await;
                let connection_id = relay.request.connection_id.clone();

                while let Some(msg) = relay.recv_message().await {
                    if let ServiceMessage::Ping(ping) = &msg {
                        if ping.messages.is_empty() {
                            relay.send_message(ServiceMessage::Ping(PingData::keepalive()));
                            continue;
                        }
                        if ping.get(KEY_OFFLINE) == Some(OFFLINE_REQUEST) {
                            relay.send_message(ServiceMessage::Ping(PingData {
                                messages: vec![KEY_OFFLINE.to_string(), OFFLINE_ACK.to_string()],
                            }));
                        }
                    }

                    if let Some(ack_id) = msg.ack_id() {
                        let handle = relay.handle();
                        tokio::spawn(async move {
                            tokio::time::sleep(ack_delay).await;
                            handle.send_message(ServiceMessage::Ack(AckData {
                                ack_id,
                                status: ack_status,
                                message: String::new(),
                            }));
                        });
                    }

                    let _ = received_send.send((connection_id.clone(), msg));
                }
            });
        }
    });

    received_recv
}
