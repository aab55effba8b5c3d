//! Session lifecycle per (client, host).
//!
//! Hosts with `reuseconnection` share one session per client for the whole run. The
//! registry lock is only held to find the per-key slot; the slot's own async lock is held
//! across the handshake so concurrent first use of a key performs exactly one handshake.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use netconf_session::{Connector, Session, TransportError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::suite::HostConfig;

type SessionKey = (usize, String);
type Slot = Arc<tokio::sync::Mutex<Option<Arc<dyn Session>>>>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to {host}: {source}")]
    Handshake {
        host: String,
        #[source]
        source: TransportError,
    },
    #[error("no config for host {0}")]
    UnknownHost(String),
}

/// A session handed out by the pool
#[derive(Debug)]
pub enum Lease {
    /// owned by the pool, shared by every action of this (client, host)
    Pooled(Arc<dyn Session>),
    /// owned by the caller, must be given back through [`ConnectionPool::release`]
    Exclusive(Box<dyn Session>),
}

impl Lease {
    pub fn session(&self) -> &dyn Session {
        match self {
            Self::Pooled(session) => session.as_ref(),
            Self::Exclusive(session) => session.as_ref(),
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, Self::Pooled(_))
    }
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<SessionKey, Slot>>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, client_id: usize, host: &HostConfig) -> Result<Lease, ConnectError> {
        if !host.reuse_connection {
            return self.handshake(host).await.map(Lease::Exclusive);
        }

        let slot = self.slot(client_id, &host.hostname);
        let mut cached = slot.lock().await;
        if let Some(session) = cached.as_ref() {
            debug!(client_id, host = %host.hostname, session_id = session.session_id(), "reusing session");
            return Ok(Lease::Pooled(Arc::clone(session)));
        }

        let session: Arc<dyn Session> = Arc::from(self.handshake(host).await?);
        debug!(client_id, host = %host.hostname, session_id = session.session_id(), "caching session");
        *cached = Some(Arc::clone(&session));
        Ok(Lease::Pooled(session))
    }

    /// give a lease back, closing it if the caller owned it
    pub async fn release(&self, lease: Lease) {
        if let Lease::Exclusive(session) = lease {
            if let Err(err) = session.close().await {
                warn!(?err, session_id = session.session_id(), "error closing session");
            }
        }
    }

    /// Drop and close the cached session for this key, the next `acquire` performs a
    /// fresh handshake.
    pub async fn evict(&self, client_id: usize, hostname: &str) {
        let slot = self
            .sessions
            .lock()
            .get(&(client_id, hostname.to_owned()))
            .cloned();
        let Some(slot) = slot else {
            return;
        };
        let evicted = slot.lock().await.take();
        if let Some(session) = evicted {
            debug!(client_id, host = %hostname, session_id = session.session_id(), "evicting session");
            if let Err(err) = session.close().await {
                debug!(?err, "error closing evicted session");
            }
        }
    }

    /// Close every pooled session. Safe to call more than once.
    pub async fn close_all(&self) {
        let slots = self
            .sessions
            .lock()
            .drain()
            .collect::<Vec<_>>();
        let mut closed = 0;
        for ((client_id, host), slot) in slots {
            let Some(session) = slot.lock().await.take() else {
                continue;
            };
            if let Err(err) = session.close().await {
                warn!(?err, client_id, %host, "error closing pooled session");
            }
            closed += 1;
        }
        debug!(closed, "closed pooled sessions");
    }

    /// live pooled sessions
    pub async fn live_sessions(&self) -> usize {
        let slots = self.sessions.lock().values().cloned().collect::<Vec<_>>();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    fn slot(&self, client_id: usize, hostname: &str) -> Slot {
        let mut sessions = self.sessions.lock();
        Arc::clone(
            sessions
                .entry((client_id, hostname.to_owned()))
                .or_default(),
        )
    }

    async fn handshake(&self, host: &HostConfig) -> Result<Box<dyn Session>, ConnectError> {
        self.connector
            .connect(&host.endpoint())
            .await
            .map_err(|source| ConnectError::Handshake {
                host: host.hostname.clone(),
                source,
            })
    }
}
