use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use url::Url;

use crate::endpoint::service_endpoint::ServiceEndpoint;

/// Everything a [ConnectionFactory] needs to open a single service connection
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub endpoint: ServiceEndpoint,
    pub hub: String,
    /// the application server's id for this connection, not the service's
    pub connection_id: String,
    pub server_name: String,
    /// for on-demand connections: the target the service asked for
    pub target: Option<String>,
}

impl ConnectionRequest {
    /// `ws(s)://<endpoint>/server/?hub=..&cid=..&server=..[&target=..]`
    pub fn url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(self.endpoint.url())?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => bail!("unsupported scheme {:?} for endpoint {}", other, self.endpoint.url()),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot switch endpoint {} to scheme {}", self.endpoint.url(), scheme))?;

        let path = format!("{}/server/", url.path().trim_end_matches('/'));
        url.set_path(&path);

        {
            let mut query = url.query_pairs_mut();
            query.clear();
            query.append_pair("hub", &self.hub.to_lowercase());
            query.append_pair("cid", &self.connection_id);
            query.append_pair("server", &self.server_name);
            if let Some(target) = &self.target {
                query.append_pair("target", target);
            }
        }
        Ok(url)
    }

    /// the audience that access tokens for this connection are issued for
    pub fn audience(&self) -> String {
        format!("{}/server/?hub={}", self.endpoint.url().trim_end_matches('/'), self.hub.to_lowercase())
    }
}

#[async_trait]
pub trait TransportReader: Send + 'static {
    /// Appends received bytes to `buf`. Returns the number of bytes read, `0` once the peer
    ///  closed the connection.
    async fn read(&mut self, buf: &mut BytesMut) -> anyhow::Result<usize>;
}

#[async_trait]
pub trait TransportWriter: Send + 'static {
    async fn write(&mut self, data: Bytes) -> anyhow::Result<()>;
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens duplex byte streams to the service. The connection logic is independent of the actual
///  transport, which makes it testable with in-memory transports.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, request: &ConnectionRequest) -> anyhow::Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>)>;
}
