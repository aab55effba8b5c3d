//! Scripted in-process transport. Replies are configured per host, every handshake and
//! close is counted so callers can assert on session lifecycle.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::errors::{Result, TransportError};
use crate::rpc::{Rpc, RpcReply};
use crate::{Connector, Endpoint, Session};

/// what a mock session answers to every call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MockReply {
    /// `<ok/>`
    #[default]
    Ok,
    /// reply carrying this body
    Data(String),
    /// `<rpc-error>` with this message, the session stays usable
    RpcError(String),
    /// the peer drops the session mid-call
    RemoteClosed,
    /// never answers
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    default_reply: MockReply,
    replies: HashMap<String, MockReply>,
    refused: HashSet<String>,
    handshake_delay: Duration,
    latency: Duration,
}

impl Script {
    fn reply_for(&self, host: &str) -> MockReply {
        self.replies
            .get(host)
            .unwrap_or(&self.default_reply)
            .clone()
    }
}

#[derive(Debug, Default)]
struct Counters {
    handshakes: HashMap<String, usize>,
    closes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    script: Mutex<Script>,
    counters: Mutex<Counters>,
    next_session_id: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// reply used for hosts without their own script
    pub fn reply(self, reply: MockReply) -> Self {
        self.inner.script.lock().default_reply = reply;
        self
    }

    pub fn reply_for(self, host: impl Into<String>, reply: MockReply) -> Self {
        self.set_reply(host, reply);
        self
    }

    /// change a host's reply while sessions are live
    pub fn set_reply(&self, host: impl Into<String>, reply: MockReply) {
        self.inner.script.lock().replies.insert(host.into(), reply);
    }

    /// handshakes with `host` fail authentication
    pub fn refuse(self, host: impl Into<String>) -> Self {
        self.inner.script.lock().refused.insert(host.into());
        self
    }

    pub fn handshake_delay(self, delay: Duration) -> Self {
        self.inner.script.lock().handshake_delay = delay;
        self
    }

    /// simulated round trip of every call
    pub fn latency(self, latency: Duration) -> Self {
        self.inner.script.lock().latency = latency;
        self
    }

    /// handshakes attempted across all hosts
    pub fn handshakes(&self) -> usize {
        self.inner.counters.lock().handshakes.values().sum()
    }

    pub fn handshakes_for(&self, host: &str) -> usize {
        self.inner
            .counters
            .lock()
            .handshakes
            .get(host)
            .copied()
            .unwrap_or_default()
    }

    /// every `close` call, including repeated ones on the same session
    pub fn closes(&self) -> usize {
        self.inner.counters.lock().closes
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>> {
        let (delay, refused) = {
            let script = self.inner.script.lock();
            (
                script.handshake_delay,
                script.refused.contains(&endpoint.hostname),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        *self
            .inner
            .counters
            .lock()
            .handshakes
            .entry(endpoint.hostname.clone())
            .or_default() += 1;
        if refused {
            return Err(TransportError::Auth {
                user: endpoint.username.clone(),
                host: endpoint.addr(),
            });
        }

        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(host = %endpoint.hostname, session_id = id, "mock session opened");
        Ok(Box::new(MockSession {
            id,
            host: endpoint.hostname.clone(),
            alive: AtomicBool::new(true),
            next_message_id: AtomicU64::new(1),
            inner: Arc::clone(&self.inner),
        }))
    }
}

#[derive(Debug)]
struct MockSession {
    id: u64,
    host: String,
    alive: AtomicBool,
    next_message_id: AtomicU64,
    inner: Arc<Inner>,
}

#[async_trait]
impl Session for MockSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn execute(&self, _rpc: &Rpc) -> Result<RpcReply> {
        if !self.is_alive() {
            return Err(TransportError::RemoteClosed);
        }
        let (reply, latency) = {
            let script = self.inner.script.lock();
            (script.reply_for(&self.host), script.latency)
        };

        // same rule as the tcp transport, a dropped call leaves the session unusable
        self.alive.store(false, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let message_id = self
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();

        let data = match reply {
            MockReply::Ok => "<ok/>".to_owned(),
            MockReply::Data(data) => data,
            MockReply::RpcError(msg) => {
                self.alive.store(true, Ordering::SeqCst);
                return Err(TransportError::Rpc(msg));
            }
            MockReply::RemoteClosed => return Err(TransportError::RemoteClosed),
            MockReply::Hang => return std::future::pending().await,
        };
        self.alive.store(true, Ordering::SeqCst);
        Ok(RpcReply { message_id, data })
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.inner.counters.lock().closes += 1;
        Ok(())
    }
}
