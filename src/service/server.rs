/*!
 * Execution Service
 *
 * Socket server of the privileged helper. Per connection:
 *
 * 1. Peer credentials must match our uid
 * 2. First frame must be a valid `Hello`, answered with `Welcome` and a
 *    fresh service session; anything else gets `Rejected` and a close
 * 3. `Execute` frames run concurrently, each with its own cancel token;
 *    `Cancel` fires it; closing the connection cancels everything still
 *    running
 * 4. Every `Execute` gets exactly one `Completed`; an outcome too large to
 *    frame is replaced by a protocol error
 */

use super::runner::CommandRunner;
use super::session::SessionValidator;
use crate::capability::SharedPlatform;
use crate::core::config::ExecConfig;
use crate::core::errors::ExecError;
use crate::core::types::{ExecResult, RequestId};
use crate::executor::{CancelToken, CommandResult};
use crate::protocol::{
    encode_frame, read_frame, write_frame, ClientFrame, ServiceFrame, PROTOCOL_VERSION,
};
use ahash::RandomState;
use bytes::BytesMut;
use dashmap::DashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

pub struct ExecutionService {
    socket_path: PathBuf,
    handshake_timeout: Duration,
    validator: SessionValidator,
    runner: Arc<CommandRunner>,
}

impl ExecutionService {
    pub fn new(config: &ExecConfig, platform: SharedPlatform) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            handshake_timeout: config.handshake_timeout,
            validator: SessionValidator::current_user(),
            runner: Arc::new(CommandRunner::new(config.allowed_commands.clone(), platform)),
        }
    }

    pub fn with_validator(mut self, validator: SessionValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one, readable by the owner only
    pub fn bind(&self) -> ExecResult<UnixListener> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %self.socket_path.display(), "Helper socket bound");
        Ok(listener)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: CancelToken) -> ExecResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let service = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.handle_connection(stream, shutdown).await {
                                warn!(error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("Helper shutting down");
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(error = %e, "Socket already gone");
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream, shutdown: CancelToken) -> ExecResult<()> {
        if let Err(e) = self.validator.check_peer(&stream) {
            let (_, mut writer) = stream.into_split();
            reject(&mut writer, &e).await;
            return Err(e);
        }

        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        let hello = match tokio::time::timeout(self.handshake_timeout, read_frame::<_, ClientFrame>(&mut reader)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let e = ExecError::InvalidSession("no hello within the handshake timeout".into());
                reject(&mut *writer.lock().await, &e).await;
                return Err(e);
            }
        };

        let session = match self.validator.check_hello(&hello) {
            Ok(session) => session,
            Err(e) => {
                reject(&mut *writer.lock().await, &e).await;
                return Err(e);
            }
        };
        send(
            &writer,
            &ServiceFrame::Welcome {
                session: session.service,
                version: PROTOCOL_VERSION,
            },
        )
        .await?;
        info!(client = %session.client, service = %session.service, "Client session accepted");

        let running: Arc<DashMap<RequestId, CancelToken, RandomState>> =
            Arc::new(DashMap::with_hasher(RandomState::new()));

        let result = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                frame = read_frame::<_, ClientFrame>(&mut reader) => frame,
            };

            match frame {
                Ok(Some(ClientFrame::Ping { nonce })) => {
                    if let Err(e) = send(&writer, &ServiceFrame::Pong { nonce }).await {
                        break Err(e);
                    }
                }
                Ok(Some(ClientFrame::Execute(envelope))) => {
                    let id = envelope.id;
                    let cancel = CancelToken::new();
                    running.insert(id, cancel.clone());

                    let runner = Arc::clone(&self.runner);
                    let writer = Arc::clone(&writer);
                    let running = Arc::clone(&running);
                    tokio::spawn(async move {
                        let outcome = runner.execute(envelope, cancel).await;
                        running.remove(&id);
                        if let Err(e) = complete(&writer, id, outcome).await {
                            debug!(request_id = %id, error = %e, "Reply not delivered");
                        }
                    });
                }
                Ok(Some(ClientFrame::Cancel { id })) => match running.get(&id) {
                    Some(cancel) => {
                        info!(request_id = %id, "Cancel requested");
                        cancel.cancel();
                    }
                    None => debug!(request_id = %id, "Cancel for unknown request"),
                },
                Ok(Some(ClientFrame::Hello { .. })) => {
                    let e = ExecError::Protocol("repeated hello".into());
                    reject(&mut *writer.lock().await, &e).await;
                    break Err(e);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        for entry in running.iter() {
            entry.value().cancel();
        }
        debug!(client = %session.client, "Client connection closed");
        result
    }
}

async fn send(writer: &SharedWriter, frame: &ServiceFrame) -> ExecResult<()> {
    let mut writer = writer.lock().await;
    write_frame(&mut *writer, frame).await
}

async fn complete(
    writer: &SharedWriter,
    id: RequestId,
    outcome: ExecResult<CommandResult>,
) -> ExecResult<()> {
    let buf = encode_completed(id, outcome)?;
    let mut writer = writer.lock().await;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Frame a `Completed`, falling back to a protocol error if it cannot fit
fn encode_completed(id: RequestId, outcome: ExecResult<CommandResult>) -> ExecResult<BytesMut> {
    match encode_frame(&ServiceFrame::Completed { id, outcome }) {
        Ok(buf) => Ok(buf),
        Err(e) => {
            warn!(request_id = %id, error = %e, "Reply does not fit in a frame");
            encode_frame(&ServiceFrame::Completed {
                id,
                outcome: Err(ExecError::Protocol(format!("reply not deliverable: {e}"))),
            })
        }
    }
}

async fn reject(writer: &mut OwnedWriteHalf, err: &ExecError) {
    warn!(reason = %err, "Rejecting connection");
    let frame = ServiceFrame::Rejected {
        reason: err.to_string(),
    };
    if let Err(e) = write_frame(writer, &frame).await {
        debug!(error = %e, "Rejection not delivered");
    }
}
