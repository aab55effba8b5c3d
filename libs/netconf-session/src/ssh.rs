//! NETCONF base:1.0 over the `netconf` SSH subsystem, authenticated with the endpoint's
//! username and password.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{Result, TransportError};
use crate::framed;
use crate::rpc::{Rpc, RpcReply};
use crate::{Connector, Endpoint, Session};

pub const SUBSYSTEM: &str = "netconf";

#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    timeout: Option<Duration>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// deadline for connect + authentication + hello exchange
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>> {
        let session = framed::with_deadline(self.timeout, handshake(endpoint)).await?;
        Ok(Box::new(session))
    }
}

/// Host keys are not pinned, devices under test are usually freshly provisioned.
struct HostKeys {
    addr: String,
}

#[async_trait]
impl client::Handler for HostKeys {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        debug!(addr = %self.addr, fingerprint = %key.fingerprint(), "accepting host key");
        Ok(true)
    }
}

async fn handshake(endpoint: &Endpoint) -> Result<SshSession> {
    let failed = |reason: String| TransportError::Handshake {
        host: endpoint.addr(),
        reason,
    };

    let config = Arc::new(client::Config::default());
    let handler = HostKeys {
        addr: endpoint.addr(),
    };
    let mut handle = client::connect(config, (endpoint.hostname.as_str(), endpoint.port), handler)
        .await
        .map_err(|err| failed(err.to_string()))?;

    let accepted = handle
        .authenticate_password(endpoint.username.as_str(), endpoint.password.as_str())
        .await
        .map_err(|err| failed(err.to_string()))?;
    if !accepted {
        return Err(TransportError::Auth {
            user: endpoint.username.clone(),
            host: endpoint.addr(),
        });
    }

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|err| failed(err.to_string()))?;
    channel
        .request_subsystem(true, SUBSYSTEM)
        .await
        .map_err(|err| failed(format!("{SUBSYSTEM} subsystem refused: {err}")))?;

    let inner = framed::hello(Box::pin(channel.into_stream()), endpoint).await?;
    Ok(SshSession {
        inner: Box::new(inner),
        handle: Mutex::new(Some(handle)),
    })
}

/// A framed session riding on an SSH channel, the connection handle lives as long as
/// the session does.
pub struct SshSession {
    inner: Box<dyn Session>,
    handle: Mutex<Option<Handle<HostKeys>>>,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for SshSession {
    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    async fn execute(&self, rpc: &Rpc) -> Result<RpcReply> {
        self.inner.execute(rpc).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };
        if let Err(err) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!(session_id = self.session_id(), %err, "ssh disconnect failed");
        }
        Ok(())
    }
}
