/*!
 * Command Requests and Results
 */

use crate::core::errors::ExecError;
use crate::core::limits::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_RETRY_BUDGET};
use crate::core::types::ExecResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A fully specified unit of work for the privileged helper
///
/// Built with the `with_*`/`arg` methods; resources listed here are granted
/// before the first attempt and released after the last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub resource_paths: Vec<PathBuf>,
    /// Retries after the first attempt
    pub retry_budget: u32,
    /// Deadline of each single attempt
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            resource_paths: Vec::new(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_resource(mut self, path: impl Into<PathBuf>) -> Self {
        self.resource_paths.push(path.into());
        self
    }

    pub fn with_resources<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.resource_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resource_paths(&self) -> &[PathBuf] {
        &self.resource_paths
    }

    /// Reject requests that can never succeed before any grant is taken
    pub fn validate(&self) -> ExecResult<()> {
        if self.command.trim().is_empty() {
            return Err(ExecError::InvalidRequest("empty command".into()));
        }
        if self.timeout.is_zero() {
            return Err(ExecError::InvalidRequest("zero timeout".into()));
        }
        if let Some(dir) = &self.working_dir {
            if dir.is_relative() {
                return Err(ExecError::InvalidRequest(format!(
                    "working directory must be absolute: {}",
                    dir.display()
                )));
            }
        }
        if let Some(path) = self.resource_paths.iter().find(|p| p.is_relative()) {
            return Err(ExecError::InvalidRequest(format!(
                "resource path must be absolute: {}",
                path.display()
            )));
        }
        Ok(())
    }
}

/// Outcome of one command run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    #[inline]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    #[inline]
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    #[inline]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Non-zero exits as a typed failure
    pub fn into_checked(self) -> ExecResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::ExecutionFailed {
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}
