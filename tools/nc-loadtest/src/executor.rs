use std::sync::Arc;
use std::time::Duration;

use netconf_session::TransportError;
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::pool::{ConnectError, ConnectionPool, Lease};
use crate::report::{ErrorKind, ResultRecord};
use crate::suite::{BuildError, HostConfig, ProtocolCall};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("session has expired")]
    SessionExpired,
    #[error(transparent)]
    Serialization(#[from] BuildError),
    #[error("session closed by remote side")]
    RemoteSessionClosed,
    #[error("timed out waiting for reply after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Protocol(TransportError),
    #[error("expected response did not match, expected: {pattern} actual: {actual}")]
    ResponseMismatch { pattern: String, actual: String },
    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(_) => ErrorKind::Connect,
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::RemoteSessionClosed => ErrorKind::RemoteSessionClosed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::ResponseMismatch { .. } => ErrorKind::ResponseMismatch,
            Self::Pattern(_) => ErrorKind::Pattern,
        }
    }
}

impl From<TransportError> for ActionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::RemoteClosed => Self::RemoteSessionClosed,
            TransportError::Timeout(after) => Self::Timeout(after),
            other => Self::Protocol(other),
        }
    }
}

/// Runs single protocol actions and turns every outcome into one [`ResultRecord`]
#[derive(Debug)]
pub struct ActionExecutor {
    pool: Arc<ConnectionPool>,
    suite_start: Instant,
    call_timeout: Option<Duration>,
    // in-flight handshakes and calls give up `grace` after the token fires
    abort: Option<(CancellationToken, Duration)>,
}

impl ActionExecutor {
    pub fn new(pool: Arc<ConnectionPool>, suite_start: Instant) -> Self {
        Self {
            pool,
            suite_start,
            call_timeout: None,
            abort: None,
        }
    }

    /// deadline for each request/reply round trip
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Once `cancel` fires, a handshake or call still running after `grace` is abandoned
    /// and recorded as a timeout.
    pub fn with_cancel(mut self, cancel: CancellationToken, grace: Duration) -> Self {
        self.abort = Some((cancel, grace));
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn execute(&self, client_id: usize, call: &ProtocolCall, host: &HostConfig) -> ResultRecord {
        let mut record = ResultRecord::new(client_id, &call.hostname, call.name());

        let acquired = tokio::select! {
            biased;
            acquired = self.pool.acquire(client_id, host) => acquired.map_err(ActionError::from),
            grace = self.aborted() => Err(ActionError::Timeout(grace)),
        };
        let outcome = match acquired {
            Ok(lease) => {
                let outcome = self.exchange(client_id, call, host, &lease, &mut record).await;
                // exclusive sessions are closed here whatever the outcome
                self.pool.release(lease).await;
                outcome
            }
            Err(err) => Err(err),
        };

        if let Err(err) = outcome {
            warn!(client_id, host = %call.hostname, operation = %record.operation, %err, "action failed");
            record.error_kind = Some(err.kind());
            record.error_text = err.to_string();
        }
        record.when_millis = millis(self.suite_start.elapsed());
        record
    }

    /// A record for a call that cannot even be attempted
    pub fn failed(&self, client_id: usize, call: &ProtocolCall, err: ActionError) -> ResultRecord {
        ResultRecord {
            error_kind: Some(err.kind()),
            error_text: err.to_string(),
            when_millis: millis(self.suite_start.elapsed()),
            ..ResultRecord::new(client_id, &call.hostname, call.name())
        }
    }

    async fn exchange(
        &self,
        client_id: usize,
        call: &ProtocolCall,
        host: &HostConfig,
        lease: &Lease,
        record: &mut ResultRecord,
    ) -> Result<(), ActionError> {
        let session = lease.session();
        if !session.is_alive() {
            if lease.is_pooled() {
                self.pool.evict(client_id, &host.hostname).await;
            }
            return Err(ActionError::SessionExpired);
        }
        record.session_id = session.session_id();

        let rpc = call.to_rpc()?;

        let start = Instant::now();
        let pending = async {
            match self.call_timeout {
                Some(timeout) => tokio::time::timeout(timeout, session.execute(&rpc))
                    .await
                    .unwrap_or(Err(TransportError::Timeout(timeout))),
                None => session.execute(&rpc).await,
            }
        };
        // an abandoned call leaves the session marked dead, pooled ones are closed at
        // teardown
        let reply = tokio::select! {
            biased;
            reply = pending => reply,
            grace = self.aborted() => Err(TransportError::Timeout(grace)),
        };
        record.latency_millis = millis(start.elapsed());

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_remote_closed() && lease.is_pooled() {
                    self.pool.evict(client_id, &host.hostname).await;
                }
                return Err(err.into());
            }
        };
        trace!(client_id, message_id = %reply.message_id, "reply received");
        record.message_id = reply.message_id;

        if let Some(pattern) = &call.expected_pattern {
            let expected = Regex::new(pattern)?;
            if !expected.is_match(&reply.data) {
                return Err(ActionError::ResponseMismatch {
                    pattern: pattern.clone(),
                    actual: reply.data,
                });
            }
        }
        Ok(())
    }

    /// resolves `grace` after cancellation, never without a token
    async fn aborted(&self) -> Duration {
        match &self.abort {
            Some((cancel, grace)) => {
                cancel.cancelled().await;
                tokio::time::sleep(*grace).await;
                *grace
            }
            None => std::future::pending().await,
        }
    }
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
