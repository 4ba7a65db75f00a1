/*!
 * Unix Socket Channel
 *
 * Client side of the helper protocol over a Unix domain socket.
 *
 * - One reader task routes `Completed`/`Pong` frames to waiting callers by
 *   request id or nonce, so concurrent executions share one socket
 * - Writes are serialized through an async mutex
 * - EOF, an I/O error or an unexpected frame closes the channel and fails
 *   every pending call with `ConnectionInterrupted`
 */

use super::traits::{ChannelConnector, ExecutionChannel, SharedChannel};
use crate::core::errors::ExecError;
use crate::core::types::{ExecResult, RequestId, SessionId};
use crate::executor::CommandResult;
use crate::protocol::{read_frame, write_frame, ClientFrame, CommandEnvelope, ServiceFrame, PROTOCOL_VERSION};
use ahash::RandomState;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<ExecResult<CommandResult>>;

/// Connects to the helper socket at a fixed path
#[derive(Debug, Clone)]
pub struct UnixConnector {
    socket_path: PathBuf,
}

impl UnixConnector {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl ChannelConnector for UnixConnector {
    async fn connect(&self) -> ExecResult<SharedChannel> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ExecError::ServiceUnavailable(format!("{}: {e}", self.socket_path.display()))
        })?;
        let channel = UnixChannel::handshake(stream, SessionId::generate()).await?;
        Ok(Arc::new(channel))
    }
}

/// State shared between the channel handle and its reader task
struct Routing {
    pending: DashMap<RequestId, Reply, RandomState>,
    pongs: DashMap<u64, oneshot::Sender<()>, RandomState>,
    closed: watch::Sender<bool>,
}

impl Routing {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Mark closed first, then fail whatever is still waiting
    fn shut(&self, reason: &str) {
        if self.closed.send_replace(true) {
            return;
        }

        let ids: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(ExecError::ConnectionInterrupted(reason.to_string())));
            }
        }
        self.pongs.clear();
        info!(reason, "Helper channel closed");
    }
}

/// Removes a pending entry if the caller stops waiting
struct PendingGuard<'a> {
    routing: &'a Routing,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.routing.pending.remove(&self.id);
    }
}

pub struct UnixChannel {
    session: SessionId,
    writer: Mutex<OwnedWriteHalf>,
    routing: Arc<Routing>,
    nonce: AtomicU64,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UnixChannel {
    /// Exchange `Hello`/`Welcome` on a fresh stream and start routing replies
    pub async fn handshake(stream: UnixStream, client_session: SessionId) -> ExecResult<Self> {
        let (mut read_half, mut write_half) = stream.into_split();

        write_frame(
            &mut write_half,
            &ClientFrame::Hello {
                session: client_session,
                version: PROTOCOL_VERSION,
            },
        )
        .await?;

        let session = match read_frame::<_, ServiceFrame>(&mut read_half).await? {
            Some(ServiceFrame::Welcome { session, version }) if version == PROTOCOL_VERSION => session,
            Some(ServiceFrame::Welcome { version, .. }) => {
                return Err(ExecError::Protocol(format!(
                    "helper speaks protocol {version}, expected {PROTOCOL_VERSION}"
                )))
            }
            Some(ServiceFrame::Rejected { reason }) => return Err(ExecError::InvalidSession(reason)),
            Some(other) => {
                return Err(ExecError::Protocol(format!(
                    "unexpected frame during handshake: {other:?}"
                )))
            }
            None => {
                return Err(ExecError::ServiceUnavailable(
                    "helper closed the socket during the handshake".into(),
                ))
            }
        };

        let (closed, _) = watch::channel(false);
        let routing = Arc::new(Routing {
            pending: DashMap::with_hasher(RandomState::new()),
            pongs: DashMap::with_hasher(RandomState::new()),
            closed,
        });
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&routing)));

        debug!(%session, "Helper handshake complete");
        Ok(Self {
            session,
            writer: Mutex::new(write_half),
            routing,
            nonce: AtomicU64::new(1),
            reader: parking_lot::Mutex::new(Some(reader)),
        })
    }

    async fn send(&self, frame: &ClientFrame) -> ExecResult<()> {
        if self.routing.is_closed() {
            return Err(ExecError::ConnectionInterrupted("channel closed".into()));
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await.map_err(|e| {
            let reason = format!("write failed: {e}");
            self.routing.shut(&reason);
            ExecError::ConnectionInterrupted(reason)
        })
    }
}

async fn read_loop(mut reader: OwnedReadHalf, routing: Arc<Routing>) {
    let reason = loop {
        match read_frame::<_, ServiceFrame>(&mut reader).await {
            Ok(Some(ServiceFrame::Completed { id, outcome })) => {
                match routing.pending.remove(&id) {
                    Some((_, reply)) => {
                        let _ = reply.send(outcome);
                    }
                    None => debug!(request_id = %id, "Reply for abandoned request dropped"),
                }
            }
            Ok(Some(ServiceFrame::Pong { nonce })) => {
                if let Some((_, reply)) = routing.pongs.remove(&nonce) {
                    let _ = reply.send(());
                }
            }
            Ok(Some(ServiceFrame::Rejected { reason })) => break format!("helper rejected: {reason}"),
            Ok(Some(ServiceFrame::Welcome { .. })) => break "unexpected welcome frame".to_string(),
            Ok(None) => break "helper closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    warn!(%reason, "Helper channel interrupted");
    routing.shut(&reason);
}

#[async_trait]
impl ExecutionChannel for UnixChannel {
    fn session(&self) -> SessionId {
        self.session
    }

    async fn ping(&self) -> ExecResult<()> {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.routing.pongs.insert(nonce, tx);

        if let Err(e) = self.send(&ClientFrame::Ping { nonce }).await {
            self.routing.pongs.remove(&nonce);
            return Err(e);
        }
        rx.await
            .map_err(|_| ExecError::ConnectionInterrupted("channel closed before pong".into()))
    }

    async fn execute(&self, envelope: CommandEnvelope) -> ExecResult<CommandResult> {
        let id = envelope.id;
        let (tx, rx) = oneshot::channel();
        self.routing.pending.insert(id, tx);
        let _guard = PendingGuard {
            routing: &self.routing,
            id,
        };

        // A close racing the insert above would never answer this entry
        if self.routing.is_closed() {
            return Err(ExecError::ConnectionInterrupted("channel closed".into()));
        }

        self.send(&ClientFrame::Execute(envelope)).await?;
        rx.await
            .map_err(|_| ExecError::ConnectionInterrupted("channel closed before reply".into()))?
    }

    async fn cancel(&self, id: RequestId) {
        if let Err(e) = self.send(&ClientFrame::Cancel { id }).await {
            debug!(request_id = %id, error = %e, "Cancel not delivered");
        }
    }

    async fn closed(&self) {
        let mut rx = self.routing.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        self.routing.is_closed()
    }

    async fn close(&self) {
        self.routing.shut("closed locally");
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *self.writer.lock().await).await;
    }
}

impl std::fmt::Debug for UnixChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixChannel")
            .field("session", &self.session)
            .field("pending", &self.routing.pending.len())
            .field("closed", &self.routing.is_closed())
            .finish()
    }
}

impl Drop for UnixChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}
