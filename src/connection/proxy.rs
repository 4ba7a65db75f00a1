/*!
 * Executor Proxy
 * Deadline-bound handle for issuing commands over the live channel
 */

use super::traits::SharedChannel;
use crate::capability::CapabilityToken;
use crate::core::errors::ExecError;
use crate::core::types::{ExecResult, RequestId, SessionId};
use crate::executor::{CommandRequest, CommandResult};
use crate::protocol::CommandEnvelope;
use std::time::Duration;
use tracing::{debug, warn};

/// Proxy over the channel that was live when it was handed out
///
/// A proxy never follows reconnects; fetch a new one per attempt.
#[derive(Clone)]
pub struct ExecutorProxy {
    channel: SharedChannel,
    generation: u64,
}

impl ExecutorProxy {
    pub(crate) fn new(channel: SharedChannel, generation: u64) -> Self {
        Self {
            channel,
            generation,
        }
    }

    /// Connection generation this proxy is bound to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> SessionId {
        self.channel.session()
    }

    /// Execute one attempt of `request` under a hard deadline
    ///
    /// On expiry the remote command is asked to stop and the attempt fails
    /// with `OperationTimeout`.
    pub async fn execute(
        &self,
        id: RequestId,
        request: &CommandRequest,
        capabilities: Vec<CapabilityToken>,
        timeout: Duration,
    ) -> ExecResult<CommandResult> {
        let envelope = CommandEnvelope::from_request(id, request, capabilities, timeout);

        match tokio::time::timeout(timeout, self.channel.execute(envelope)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "Attempt deadline elapsed");
                self.channel.cancel(id).await;
                Err(ExecError::timeout(timeout))
            }
        }
    }

    pub async fn cancel(&self, id: RequestId) {
        debug!(request_id = %id, "Cancelling remote command");
        self.channel.cancel(id).await;
    }

    pub async fn ping(&self) -> ExecResult<()> {
        self.channel.ping().await
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

impl std::fmt::Debug for ExecutorProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorProxy")
            .field("generation", &self.generation)
            .field("session", &self.channel.session())
            .finish()
    }
}
