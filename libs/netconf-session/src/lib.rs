//! Session capability used by the load generator. NETCONF runs over SSH (password
//! authentication, `netconf` subsystem) or plain TCP, and a scripted in-process transport
//! stands in for devices in tests and dry runs.
//!
//! All transports sit behind the same [`Connector`]/[`Session`] pair, so callers never
//! know which one they are driving.
mod errors;
mod framed;

pub mod codec;
pub mod mock;
pub mod rpc;
pub mod ssh;
pub mod tcp;

use std::fmt;

use async_trait::async_trait;

pub use crate::errors::{Result, TransportError};
pub use crate::mock::{MockConnector, MockReply};
pub use crate::rpc::{Rpc, RpcReply};
pub use crate::ssh::SshConnector;
pub use crate::tcp::TcpConnector;

/// IANA port for NETCONF over SSH
pub const DEFAULT_PORT: u16 = 830;

/// Where and as whom to open a session
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Endpoint {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

// keep the password out of logs
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish()
    }
}

/// One live protocol channel to a device
#[async_trait]
pub trait Session: fmt::Debug + Send + Sync {
    /// remote-assigned session id from the server hello
    fn session_id(&self) -> u64;

    /// `false` once the channel was closed locally, torn down by the peer, or left
    /// mid-call
    fn is_alive(&self) -> bool;

    /// send one request and wait for its reply
    async fn execute(&self, rpc: &Rpc) -> Result<RpcReply>;

    /// Close the channel. Closing an already closed session is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Performs the transport handshake and hands back a fresh [`Session`]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>>;
}
