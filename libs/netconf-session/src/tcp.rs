//! NETCONF base:1.0 over a plain TCP stream, no authentication takes place
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::errors::{Result, TransportError};
use crate::framed;
use crate::{Connector, Endpoint, Session};

#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// deadline for connect + hello exchange
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>> {
        let session = framed::with_deadline(self.timeout, async {
            let stream = TcpStream::connect((endpoint.hostname.as_str(), endpoint.port))
                .await
                .map_err(|err| TransportError::Handshake {
                    host: endpoint.addr(),
                    reason: err.to_string(),
                })?;
            stream.set_nodelay(true)?;
            framed::hello(stream, endpoint).await
        })
        .await?;
        Ok(Box::new(session))
    }
}
