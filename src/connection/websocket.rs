use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::connection::transport::{ConnectionFactory, ConnectionRequest, TransportReader, TransportWriter};
use crate::endpoint::access_key::AccessTokenProvider;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the service through WebSockets, authenticating with a bearer token that is minted
///  from the endpoint's access key
pub struct WebSocketConnectionFactory {
    token_provider: Arc<dyn AccessTokenProvider>,
    /// bounds waiting for an identity based key to become available
    authorize_timeout: Duration,
}

impl WebSocketConnectionFactory {
    pub fn new(token_provider: Arc<dyn AccessTokenProvider>, authorize_timeout: Duration) -> WebSocketConnectionFactory {
        WebSocketConnectionFactory {
            token_provider,
            authorize_timeout,
        }
    }
}

#[async_trait]
impl ConnectionFactory for WebSocketConnectionFactory {
    async fn connect(&self, request: &ConnectionRequest) -> anyhow::Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)> {
        let url = request.url()?;

        let key = request.endpoint.access_key()
            .key_material(self.authorize_timeout)
            .await?;
        let token = self.token_provider
            .access_token(&key, &request.audience())
            .await?;

        let mut ws_request = url.as_str().into_client_request()?;
        ws_request.headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);

        debug!(endpoint = ?request.endpoint, connection_id = %request.connection_id, "opening websocket");
        let (ws_stream, _) = connect_async(ws_request).await?;

        let (sink, stream) = ws_stream.split();
        Ok((
            Box::new(WebSocketReader { stream }),
            Box::new(WebSocketWriter { sink }),
        ))
    }
}

struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReader for WebSocketReader {
    async fn read(&mut self, buf: &mut BytesMut) -> anyhow::Result<usize> {
        loop {
            match self.stream.next().await {
                None => return Ok(0),
                Some(Ok(Message::Binary(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    buf.extend_from_slice(&data);
                    return Ok(data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("service closed the websocket: {:?}", frame);
                    return Ok(0);
                }
                Some(Ok(other)) => {
                    // websocket level pings are answered by tungstenite
                    trace!("ignoring websocket message {:?}", other);
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

struct WebSocketWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportWriter for WebSocketWriter {
    async fn write(&mut self, data: Bytes) -> anyhow::Result<()> {
        self.sink.send(Message::Binary(data)).await?;
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.sink.send(Message::Close(None)).await?;
        Ok(())
    }
}
