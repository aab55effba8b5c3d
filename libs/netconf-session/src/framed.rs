//! Request/reply exchange over any byte stream carrying base:1.0 framing
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::codec::EomCodec;
use crate::errors::{Result, TransportError};
use crate::rpc::{self, Rpc, RpcReply};
use crate::{Endpoint, Session};

/// how long `close` waits for the `<close-session>` reply
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// first message-id handed out on a new session
const FIRST_MESSAGE_ID: u64 = 101;

/// Run a connect future under an optional deadline
pub(crate) async fn with_deadline<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| TransportError::Timeout(timeout))?,
        None => fut.await,
    }
}

/// Exchange hellos on a freshly opened stream
pub(crate) async fn hello<T>(stream: T, endpoint: &Endpoint) -> Result<FramedSession<T>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let failed = |reason: &str| TransportError::Handshake {
        host: endpoint.addr(),
        reason: reason.to_owned(),
    };

    let mut channel = Framed::new(stream, EomCodec::new());
    channel.send(rpc::client_hello()).await?;
    let hello = match channel.next().await {
        Some(frame) => frame?,
        None => return Err(failed("connection closed before server hello")),
    };
    trace!(%hello, "received server hello");

    let session_id =
        rpc::parse_session_id(&hello).ok_or_else(|| failed("server hello carried no session-id"))?;
    debug!(addr = %endpoint.addr(), session_id, "netconf session established");

    Ok(FramedSession {
        session_id,
        channel: Mutex::new(Some(channel)),
        next_message_id: AtomicU64::new(FIRST_MESSAGE_ID),
        alive: AtomicBool::new(true),
    })
}

pub struct FramedSession<T> {
    session_id: u64,
    // `None` once closed or torn down
    channel: Mutex<Option<Framed<T, EomCodec>>>,
    next_message_id: AtomicU64,
    alive: AtomicBool,
}

impl<T> fmt::Debug for FramedSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedSession")
            .field("session_id", &self.session_id)
            .field("alive", &self.alive)
            .finish()
    }
}

impl<T> FramedSession<T> {
    fn message_id(&self) -> String {
        self.next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string()
    }
}

#[async_trait]
impl<T> Session for FramedSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn session_id(&self) -> u64 {
        self.session_id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn execute(&self, rpc: &Rpc) -> Result<RpcReply> {
        let mut guard = self.channel.lock().await;
        let Some(channel) = guard.as_mut() else {
            return Err(TransportError::RemoteClosed);
        };
        // stays false if this future is dropped before the reply is read, the stream
        // would be out of step with the next request
        self.alive.store(false, Ordering::SeqCst);

        let message_id = self.message_id();
        let request = rpc.to_xml(&message_id);
        trace!(session_id = self.session_id, %request, "sending rpc");
        if let Err(err) = channel.send(request).await {
            *guard = None;
            return Err(hangup(err));
        }

        let next = channel.next().await;
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                *guard = None;
                return Err(hangup(err));
            }
            None => {
                *guard = None;
                return Err(TransportError::RemoteClosed);
            }
        };
        self.alive.store(true, Ordering::SeqCst);
        trace!(session_id = self.session_id, %frame, "received reply");

        let reply = RpcReply::parse(&frame)?;
        if !reply.message_id.is_empty() && reply.message_id != message_id {
            return Err(TransportError::Malformed(format!(
                "reply message-id {} does not match request {message_id}",
                reply.message_id
            )));
        }
        Ok(reply)
    }

    async fn close(&self) -> Result<()> {
        let taken = self.channel.lock().await.take();
        let Some(mut channel) = taken else {
            return Ok(());
        };
        self.alive.store(false, Ordering::SeqCst);

        // best effort, the server may already be gone
        let request = Rpc::new("<close-session/>").to_xml(&self.message_id());
        if channel.send(request).await.is_ok() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, channel.next()).await;
        }
        debug!(session_id = self.session_id, "netconf session closed");
        Ok(())
    }
}

/// io errors that mean the peer tore the connection down
fn hangup(err: TransportError) -> TransportError {
    match err {
        TransportError::Io(ref io)
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            TransportError::RemoteClosed
        }
        other => other,
    }
}

