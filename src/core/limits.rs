/*!
 * System Limits and Constants
 *
 * Centralized location for timeouts, retry bounds and size limits used by
 * the execution core and the privileged helper.
 *
 * - Security-critical constants are marked with [SECURITY]
 * - Values that bound user-visible latency are marked with [LATENCY]
 */

use std::time::Duration;

// =============================================================================
// ACCESS GRANTS
// =============================================================================

/// Maximum lifetime of an open access grant before it is reported as leaked
/// A grant older than this means start-access ran without a matching stop.
pub const DEFAULT_GRANT_MAX_DURATION: Duration = Duration::from_secs(300);

// =============================================================================
// CONNECTION
// =============================================================================

/// Deadline for the liveness handshake with the privileged helper
/// [LATENCY]
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Automatic reconnect attempts after a transport interruption
/// Further attempts are driven by the next submitted command.
pub const DEFAULT_AUTO_RECONNECT_ATTEMPTS: u32 = 1;

/// Default helper socket location
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/scoped-exec.sock";

/// Largest accepted wire frame (16MB)
/// [SECURITY] Bounds memory a peer can make us allocate with one length prefix
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Default per-attempt deadline for a command
/// Backups routinely run for hours, so this is deliberately generous.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Default number of retries after the first attempt
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Base delay for exponential backoff
/// [LATENCY]
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// Cap on the backoff exponent (base * 2^6 = 64s with the default base)
/// [LATENCY]
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Retries allowed for "repository locked" failures, within the retry budget
pub const DEFAULT_LOCK_RETRY_LIMIT: u32 = 3;

/// Captured bytes kept per output stream; earlier output is dropped
/// [SECURITY] Both streams together stay well below `MAX_FRAME_BYTES`
pub const MAX_CAPTURED_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Grace period between SIGINT and a hard kill of a cancelled child
pub const CHILD_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Default external tool
pub const DEFAULT_TOOL: &str = "restic";

/// Vault key prefix for repository passwords
pub const REPOSITORY_PASSWORD_PREFIX: &str = "repository-password:";
