use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },
    #[error("authentication failed for {user}@{host}")]
    Auth { user: String, host: String },
    /// the server tore the session down while a call was outstanding
    #[error("session closed by remote side")]
    RemoteClosed,
    #[error("timed out waiting for reply after {0:?}")]
    Timeout(Duration),
    /// `<rpc-error>` returned by the server
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn is_remote_closed(&self) -> bool {
        matches!(self, Self::RemoteClosed)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
