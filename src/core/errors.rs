/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 *
 * `ExecError` is the only error type surfaced to callers of the execution
 * core. It is serializable so the privileged helper can return it across
 * the channel unchanged.
 */

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// Re-export subsystem errors
pub use crate::capability::types::CapabilityError;
pub use crate::vault::VaultError;

/// Typed failure taxonomy for command execution
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(rename_all = "snake_case")]
pub enum ExecError {
    #[error("Access denied: {}", .0.display())]
    #[diagnostic(
        code(exec::access_denied),
        help("Grant access to this location again and retry the operation.")
    )]
    AccessDenied(PathBuf),

    #[error("Invalid session: {0}")]
    #[diagnostic(
        code(exec::invalid_session),
        help("The helper process could not be verified. The connection was dropped.")
    )]
    InvalidSession(String),

    #[error("Connection to the execution helper is not established")]
    #[diagnostic(code(exec::not_connected))]
    ConnectionNotEstablished,

    #[error("Execution helper unavailable: {0}")]
    #[diagnostic(
        code(exec::service_unavailable),
        help("Check that the helper is installed and running.")
    )]
    ServiceUnavailable(String),

    #[error("Connection interrupted: {0}")]
    #[diagnostic(code(exec::connection_interrupted))]
    ConnectionInterrupted(String),

    #[error("Command exited with code {exit_code}: {stderr}")]
    #[diagnostic(code(exec::execution_failed))]
    ExecutionFailed { exit_code: i32, stderr: String },

    #[error("Repository is locked by another process: {stderr}")]
    #[diagnostic(
        code(exec::repository_locked),
        help("Another backup or maintenance run holds the repository lock.")
    )]
    RepositoryLocked { exit_code: i32, stderr: String },

    #[error("Operation timed out after {elapsed_ms}ms")]
    #[diagnostic(
        code(exec::timeout),
        help("Operation exceeded its deadline. Consider a longer per-attempt timeout.")
    )]
    OperationTimeout { elapsed_ms: u64 },

    #[error("Operation cancelled")]
    #[diagnostic(code(exec::cancelled))]
    OperationCancelled,

    #[error("Giving up after {attempts} attempts: {last}")]
    #[diagnostic(code(exec::retries_exhausted))]
    RetriesExhausted { attempts: u32, last: Box<ExecError> },

    #[error("Invalid request: {0}")]
    #[diagnostic(code(exec::invalid_request))]
    InvalidRequest(String),

    #[error("Corrupt capability for {}: {reason}", path.display())]
    #[diagnostic(
        code(exec::corrupt_capability),
        help("The stored access token cannot be read. Remove it and grant access again.")
    )]
    CorruptCapability { path: PathBuf, reason: String },

    #[error("Not found: {0}")]
    #[diagnostic(code(exec::not_found))]
    NotFound(String),

    #[error("Vault error: {0}")]
    #[diagnostic(code(exec::vault))]
    Vault(String),

    #[error("Protocol error: {0}")]
    #[diagnostic(code(exec::protocol))]
    Protocol(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(exec::io))]
    Io(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(
        code(exec::configuration),
        help("Review the SCOPED_EXEC_* environment variables.")
    )]
    Configuration(String),
}

impl ExecError {
    /// Whether a fresh attempt may succeed where this one failed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable(_)
                | Self::ConnectionNotEstablished
                | Self::ConnectionInterrupted(_)
                | Self::OperationTimeout { .. }
                | Self::RepositoryLocked { .. }
        )
    }

    /// Lock contention is transient but gets its own, tighter retry bound
    #[must_use]
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::RepositoryLocked { .. })
    }

    /// The helper no longer trusts this session; the channel must be
    /// dropped and a new handshake made before anything else is sent
    ///
    /// Interruptions are left to the connection monitor.
    #[must_use]
    pub fn invalidates_connection(&self) -> bool {
        matches!(self, Self::InvalidSession(_))
    }

    pub(crate) fn timeout(elapsed: std::time::Duration) -> Self {
        Self::OperationTimeout {
            elapsed_ms: elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }
}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::Io(err.to_string())
    }
}

impl From<bincode::Error> for ExecError {
    fn from(err: bincode::Error) -> Self {
        ExecError::Protocol(err.to_string())
    }
}

impl From<VaultError> for ExecError {
    fn from(err: VaultError) -> Self {
        ExecError::Vault(err.to_string())
    }
}

impl From<CapabilityError> for ExecError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::NotFound(path) | CapabilityError::Denied(path) => {
                ExecError::AccessDenied(path)
            }
            CapabilityError::Corrupt { path, reason } => {
                ExecError::CorruptCapability { path, reason }
            }
            CapabilityError::Stale(path) => ExecError::AccessDenied(path),
            CapabilityError::Vault(err) => ExecError::Vault(err.to_string()),
            CapabilityError::Platform(msg) => ExecError::Io(msg),
        }
    }
}
