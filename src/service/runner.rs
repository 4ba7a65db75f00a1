/*!
 * Command Runner
 *
 * Runs allow-listed tools for validated sessions:
 *
 * - Command names are checked for shell metacharacters, traversal and
 *   membership in the allow list
 * - Every capability token is resolved and its access begun through the
 *   platform before the child starts, and ended after it exits
 * - The child gets a cleared environment plus the request's variables and
 *   the helper's `PATH`
 * - Deadline or cancel: SIGINT first so the tool can drop its locks, then
 *   kill once the grace period is over
 * - Only the tail of each output stream is kept, so any reply fits in one
 *   frame; the final summary and error lines are at the end
 */

use crate::capability::{CapabilityToken, ResourceHandle, SharedPlatform};
use crate::core::errors::ExecError;
use crate::core::limits::{CHILD_TERMINATION_GRACE, MAX_CAPTURED_OUTPUT_BYTES};
use crate::core::types::ExecResult;
use crate::executor::{CancelToken, CommandResult};
use crate::protocol::CommandEnvelope;
use bytes::{Buf, BytesMut};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Output fragment identifying lock contention in the backup tool
const LOCKED_MARKER: &str = "repository is already locked";

const DANGEROUS_CHARS: [char; 10] = [';', '|', '&', '\n', '\r', '\0', '`', '$', '(', ')'];

pub struct CommandRunner {
    allowed: Vec<String>,
    platform: SharedPlatform,
    grace: Duration,
    output_limit: usize,
}

impl CommandRunner {
    pub fn new(allowed: Vec<String>, platform: SharedPlatform) -> Self {
        Self {
            allowed,
            platform,
            grace: CHILD_TERMINATION_GRACE,
            output_limit: MAX_CAPTURED_OUTPUT_BYTES,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Bytes kept per stream, capped at `MAX_CAPTURED_OUTPUT_BYTES`
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit.min(MAX_CAPTURED_OUTPUT_BYTES);
        self
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// Validate, grant, run and classify one command
    pub async fn execute(
        &self,
        envelope: CommandEnvelope,
        cancel: CancelToken,
    ) -> ExecResult<CommandResult> {
        self.validate_command(&envelope.command)?;
        let handles = self.begin_capabilities(&envelope.capabilities)?;

        let outcome = self.run(&envelope, &cancel).await;

        for handle in handles.iter().rev() {
            self.platform.end_access(handle);
        }
        outcome
    }

    fn validate_command(&self, command: &str) -> ExecResult<()> {
        if command.trim().is_empty() {
            return Err(ExecError::InvalidRequest("empty command".into()));
        }
        if command.contains(DANGEROUS_CHARS) {
            return Err(ExecError::InvalidRequest(
                "command contains shell metacharacters".into(),
            ));
        }
        if command.contains("..") {
            return Err(ExecError::InvalidRequest(
                "command contains path traversal".into(),
            ));
        }
        if !self.allowed.iter().any(|allowed| allowed == command) {
            return Err(ExecError::InvalidRequest(format!(
                "command {command:?} is not allowed"
            )));
        }
        Ok(())
    }

    /// All tokens or none: partial grants are ended before returning
    fn begin_capabilities(&self, tokens: &[CapabilityToken]) -> ExecResult<Vec<ResourceHandle>> {
        let mut handles: Vec<ResourceHandle> = Vec::with_capacity(tokens.len());

        for token in tokens {
            let granted = match self.platform.resolve_token(token.bytes()) {
                Ok(resolution) if resolution.is_stale => {
                    Err(ExecError::AccessDenied(token.path().to_path_buf()))
                }
                Ok(resolution) => {
                    if self.platform.begin_access(&resolution.handle) {
                        Ok(resolution.handle)
                    } else {
                        Err(ExecError::AccessDenied(token.path().to_path_buf()))
                    }
                }
                Err(err) if err.is_denial() => Err(ExecError::AccessDenied(token.path().to_path_buf())),
                Err(err) => Err(ExecError::CorruptCapability {
                    path: token.path().to_path_buf(),
                    reason: err.to_string(),
                }),
            };

            match granted {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(path = %token.path().display(), error = %err, "Capability rejected");
                    for handle in handles.iter().rev() {
                        self.platform.end_access(handle);
                    }
                    return Err(err);
                }
            }
        }

        Ok(handles)
    }

    async fn run(&self, envelope: &CommandEnvelope, cancel: &CancelToken) -> ExecResult<CommandResult> {
        let mut cmd = Command::new(&envelope.command);
        cmd.args(&envelope.args);

        // Start with clean slate; keep PATH so the allow-listed tool resolves
        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(&envelope.env);

        if let Some(dir) = &envelope.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::InvalidRequest(format!("{}: {e}", envelope.command)))?;
        let pid = child.id();
        let started = Instant::now();
        info!(request_id = %envelope.id, command = %envelope.command, pid, "Spawned command");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.output_limit;
        let output = async {
            tokio::try_join!(
                child.wait(),
                capture_tail(stdout, limit),
                capture_tail(stderr, limit)
            )
        };
        tokio::pin!(output);

        let stop_reason = tokio::select! {
            result = &mut output => {
                let (status, stdout, stderr) = result?;
                let exit_code = status.code().unwrap_or(-1);
                debug!(
                    request_id = %envelope.id,
                    exit_code,
                    duration_ms = started.elapsed().as_millis() as u64,
                    stdout_dropped = stdout.dropped,
                    stderr_dropped = stderr.dropped,
                    "Command exited"
                );
                return classify(exit_code, stdout.into_text(), stderr.into_text());
            }
            _ = tokio::time::sleep(envelope.timeout()) => ExecError::timeout(envelope.timeout()),
            _ = cancel.cancelled() => ExecError::OperationCancelled,
        };

        warn!(request_id = %envelope.id, reason = %stop_reason, "Stopping command");
        if let Some(pid) = pid {
            if let Err(errno) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                debug!(pid, %errno, "SIGINT not delivered");
            }
        }
        // Dropping the child afterwards kills whatever is still running
        let _ = tokio::time::timeout(self.grace, &mut output).await;
        Err(stop_reason)
    }
}

/// Tail of one output stream
#[derive(Debug, Default)]
struct CapturedOutput {
    tail: BytesMut,
    /// Bytes discarded from the front
    dropped: u64,
}

impl CapturedOutput {
    fn into_text(self) -> String {
        if self.dropped == 0 {
            return String::from_utf8_lossy(&self.tail).into_owned();
        }
        // Start at a line boundary when one is in reach
        let start = self
            .tail
            .iter()
            .position(|&b| b == b'\n')
            .map_or(0, |newline| newline + 1);
        let dropped = self.dropped + start as u64;
        format!(
            "[{dropped} earlier bytes truncated]\n{}",
            String::from_utf8_lossy(&self.tail[start..])
        )
    }
}

/// Drain `reader`, keeping only its last `limit` bytes
async fn capture_tail<R>(reader: Option<R>, limit: usize) -> std::io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut captured = CapturedOutput::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(captured);
        }
        captured.tail.extend_from_slice(&chunk[..n]);
        if captured.tail.len() > limit {
            let excess = captured.tail.len() - limit;
            captured.tail.advance(excess);
            captured.dropped += excess as u64;
        }
    }
}

/// Map an exit into the result taxonomy
pub fn classify(exit_code: i32, stdout: String, stderr: String) -> ExecResult<CommandResult> {
    if exit_code == 0 {
        return Ok(CommandResult::new(exit_code, stdout, stderr));
    }
    if stderr.to_ascii_lowercase().contains(LOCKED_MARKER) {
        return Err(ExecError::RepositoryLocked { exit_code, stderr });
    }
    Err(ExecError::ExecutionFailed { exit_code, stderr })
}
