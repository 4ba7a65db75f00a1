/*!
 * Executor Module
 * Command submission, retries, cancellation and the backup facade
 */

pub mod cancel;
pub mod command_executor;
pub mod facade;
pub mod request;
pub mod snapshot;

pub use cancel::CancelToken;
pub use command_executor::CommandExecutor;
pub use facade::BackupClient;
pub use request::{CommandRequest, CommandResult};
pub use snapshot::{parse_snapshots, SnapshotDescriptor};
