/*!
 * Wire Types
 * Frames exchanged between the client core and the privileged helper
 */

use crate::capability::CapabilityToken;
use crate::core::errors::ExecError;
use crate::core::types::{RequestId, SessionId};
use crate::executor::{CommandRequest, CommandResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Bumped on any incompatible frame change
pub const PROTOCOL_VERSION: u16 = 1;

/// One command as it crosses the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: RequestId,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub capabilities: Vec<CapabilityToken>,
    pub timeout_ms: u64,
}

impl CommandEnvelope {
    pub fn from_request(
        id: RequestId,
        request: &CommandRequest,
        capabilities: Vec<CapabilityToken>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            command: request.command.clone(),
            args: request.args.clone(),
            env: request.env.clone(),
            working_dir: request.working_dir.clone(),
            capabilities,
            timeout_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Hello { session: SessionId, version: u16 },
    Ping { nonce: u64 },
    Execute(CommandEnvelope),
    Cancel { id: RequestId },
}

/// Frames sent by the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceFrame {
    Welcome { session: SessionId, version: u16 },
    Pong { nonce: u64 },
    Completed {
        id: RequestId,
        outcome: Result<CommandResult, ExecError>,
    },
    /// Connection refused; the helper closes the socket after sending it
    Rejected { reason: String },
}
