/*!
 * Scoped Exec Library
 *
 * Privilege-separated command execution: a confined caller obtains
 * capability-backed access to filesystem resources, hands commands to a
 * privileged helper process over an authenticated channel, and gets
 * structured results or typed failures back.
 */

pub mod access;
pub mod capability;
pub mod connection;
pub mod core;
pub mod executor;
pub mod monitoring;
pub mod protocol;
pub mod service;
pub mod vault;

// Re-exports
pub use access::{AccessBroker, AccessScope, ActiveGrant, GrantInfo};
pub use capability::{
    CapabilityError, CapabilityPlatform, CapabilityStore, CapabilityToken, PathCapabilityPlatform,
    Resolution, ResourceHandle, SharedPlatform,
};
pub use connection::{
    ChannelConnector, ConnectionManager, ConnectionState, ExecutionChannel, ExecutorProxy,
    SharedChannel, UnixChannel, UnixConnector,
};
pub use crate::core::{ExecConfig, ExecError, ExecResult, RequestId, ResourceKey, RetryPolicy, SessionId};
pub use executor::{
    BackupClient, CancelToken, CommandExecutor, CommandRequest, CommandResult, SnapshotDescriptor,
};
pub use monitoring::{init_tracing, LogLevel, LogSink, MemorySink, SharedSink, TracingSink};
pub use service::{CommandRunner, ExecutionService, SessionValidator};
pub use vault::{open_vault, FileVault, MemoryVault, SecretVault, SharedVault, VaultError};
