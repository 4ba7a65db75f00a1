/*!
 * Execution Configuration
 *
 * Defaults, presets and environment overrides for both sides of the
 * channel.
 */

use super::errors::ExecError;
use super::limits::*;
use super::types::ExecResult;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Backoff and retry bounds used by the command executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay unit; the n-th retry waits `base * 2^min(n, max_exponent)`
    pub base: Duration,
    pub max_exponent: u32,
    /// Retries granted to lock contention, still bounded by the request budget
    pub lock_retry_limit: u32,
}

impl RetryPolicy {
    pub const fn new(base: Duration) -> Self {
        Self {
            base,
            max_exponent: MAX_BACKOFF_EXPONENT,
            lock_retry_limit: DEFAULT_LOCK_RETRY_LIMIT,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent);
        self.base.saturating_mul(2u32.saturating_pow(exponent))
    }

    /// Upper bound of the total sleep for a given retry budget
    #[must_use]
    pub fn max_total_delay(&self, retry_budget: u32) -> Duration {
        (1..=retry_budget).fold(Duration::ZERO, |acc, n| acc.saturating_add(self.backoff(n)))
    }

    #[must_use]
    pub fn with_lock_retry_limit(mut self, limit: u32) -> Self {
        self.lock_retry_limit = limit;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE)
    }
}

/// Configuration shared by the client core and the helper binary
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Helper socket path
    pub socket_path: PathBuf,
    /// Deadline for the connect handshake (default: 5s)
    pub handshake_timeout: Duration,
    /// Automatic reconnects after an interruption (default: 1)
    pub auto_reconnect_attempts: u32,
    /// Grant lifetime before it counts as leaked (default: 300s)
    pub grant_max_duration: Duration,
    /// Per-attempt deadline for facade commands
    pub command_timeout: Duration,
    /// Retry budget for facade commands
    pub retry_budget: u32,
    pub retry: RetryPolicy,
    /// External tool invoked by the facade
    pub tool: String,
    /// Commands the helper agrees to run
    pub allowed_commands: Vec<String>,
    /// Backing file for the file vault, if any
    pub vault_path: Option<PathBuf>,
}

impl ExecConfig {
    /// Create default configuration
    pub fn new() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            auto_reconnect_attempts: DEFAULT_AUTO_RECONNECT_ATTEMPTS,
            grant_max_duration: DEFAULT_GRANT_MAX_DURATION,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry: RetryPolicy::default(),
            tool: DEFAULT_TOOL.to_string(),
            allowed_commands: vec![DEFAULT_TOOL.to_string()],
            vault_path: None,
        }
    }

    /// Short deadlines for development and tests
    pub fn aggressive() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(1),
            grant_max_duration: Duration::from_secs(60),
            command_timeout: Duration::from_secs(30),
            retry_budget: 1,
            retry: RetryPolicy::new(Duration::from_millis(50)),
            ..Self::new()
        }
    }

    /// Generous deadlines for slow disks and network repositories
    pub fn relaxed() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            grant_max_duration: Duration::from_secs(24 * 60 * 60),
            command_timeout: Duration::from_secs(24 * 60 * 60),
            retry_budget: 5,
            retry: RetryPolicy::new(Duration::from_secs(2)),
            ..Self::new()
        }
    }

    /// Defaults overridden by `SCOPED_EXEC_*` environment variables
    ///
    /// - `SCOPED_EXEC_SOCKET`: helper socket path
    /// - `SCOPED_EXEC_HANDSHAKE_TIMEOUT_MS`: handshake deadline
    /// - `SCOPED_EXEC_GRANT_MAX_SECS`: grant lifetime before leak detection
    /// - `SCOPED_EXEC_COMMAND_TIMEOUT_SECS`: per-attempt command deadline
    /// - `SCOPED_EXEC_RETRY_BASE_MS`: backoff base
    /// - `SCOPED_EXEC_RETRY_BUDGET`: retries after the first attempt
    /// - `SCOPED_EXEC_TOOL`: external tool for the facade
    /// - `SCOPED_EXEC_ALLOWED_COMMANDS`: comma separated helper allow list
    /// - `SCOPED_EXEC_VAULT_PATH`: file vault location
    pub fn from_env() -> ExecResult<Self> {
        let mut config = Self::new();

        if let Some(socket) = env_var("SCOPED_EXEC_SOCKET") {
            config.socket_path = PathBuf::from(socket);
        }
        if let Some(ms) = parse_env::<u64>("SCOPED_EXEC_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env::<u64>("SCOPED_EXEC_GRANT_MAX_SECS")? {
            config.grant_max_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("SCOPED_EXEC_COMMAND_TIMEOUT_SECS")? {
            config.command_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_env::<u64>("SCOPED_EXEC_RETRY_BASE_MS")? {
            config.retry.base = Duration::from_millis(ms);
        }
        if let Some(budget) = parse_env::<u32>("SCOPED_EXEC_RETRY_BUDGET")? {
            config.retry_budget = budget;
        }
        if let Some(tool) = env_var("SCOPED_EXEC_TOOL") {
            config.tool = tool;
        }
        if let Some(list) = env_var("SCOPED_EXEC_ALLOWED_COMMANDS") {
            config.allowed_commands = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = env_var("SCOPED_EXEC_VAULT_PATH") {
            config.vault_path = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_grant_max_duration(mut self, duration: Duration) -> Self {
        self.grant_max_duration = duration;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        let tool = tool.into();
        if !self.allowed_commands.contains(&tool) {
            self.allowed_commands.push(tool.clone());
        }
        self.tool = tool;
        self
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> ExecResult<()> {
        if self.handshake_timeout.is_zero() {
            return Err(ExecError::Configuration(
                "handshake timeout must be greater than zero".into(),
            ));
        }
        if self.grant_max_duration.is_zero() {
            return Err(ExecError::Configuration(
                "grant max duration must be greater than zero".into(),
            ));
        }
        if self.tool.trim().is_empty() {
            return Err(ExecError::Configuration("tool must not be empty".into()));
        }
        if self.allowed_commands.is_empty() {
            return Err(ExecError::Configuration(
                "at least one allowed command is required".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(name: &str) -> ExecResult<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ExecError::Configuration(format!("{name}: cannot parse {raw:?}"))),
    }
}
