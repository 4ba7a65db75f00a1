/*!
 * Channel Traits
 * Transport seams between the connection manager and the helper
 */

use crate::core::types::{ExecResult, RequestId, SessionId};
use crate::executor::CommandResult;
use crate::protocol::CommandEnvelope;
use async_trait::async_trait;
use std::sync::Arc;

/// An established, authenticated channel to the privileged helper
///
/// Safe to share across tasks; each `execute` is an independent round-trip.
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Session announced by the remote side during the handshake
    fn session(&self) -> SessionId;

    /// No-op round-trip
    async fn ping(&self) -> ExecResult<()>;

    /// Run one command and wait for its reply; no deadline of its own
    async fn execute(&self, envelope: CommandEnvelope) -> ExecResult<CommandResult>;

    /// Best-effort request to stop an in-flight command
    async fn cancel(&self, id: RequestId);

    /// Resolves once the transport is gone, for whatever reason
    async fn closed(&self);

    fn is_closed(&self) -> bool;

    /// Tear the transport down; pending calls fail with `ConnectionInterrupted`
    async fn close(&self);
}

pub type SharedChannel = Arc<dyn ExecutionChannel>;

/// Locates the helper and performs the transport-level handshake
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// `ServiceUnavailable` when the helper cannot be reached
    async fn connect(&self) -> ExecResult<SharedChannel>;
}
