/*!
 * Command Executor
 *
 * Grants, submits, and retries commands:
 *
 * 1. Validate the request and take a counted grant for every resource path
 *    (all or nothing)
 * 2. Run one attempt at a time over the current proxy, each under the
 *    request's per-attempt deadline
 * 3. Retry transient failures with exponential backoff, up to the retry
 *    budget; lock contention has its own tighter bound
 * 4. Release every grant on all exit paths, cancellation included
 *
 * Grant acquisition reads and may rewrite persisted tokens, so it runs on
 * the blocking pool rather than on the async workers.
 */

use super::cancel::CancelToken;
use super::request::{CommandRequest, CommandResult};
use crate::access::{AccessBroker, AccessScope};
use crate::capability::CapabilityToken;
use crate::connection::ConnectionManager;
use crate::core::config::{ExecConfig, RetryPolicy};
use crate::core::errors::ExecError;
use crate::core::types::{ExecResult, RequestId};
use crate::monitoring::{CommandSpan, LogLevel, SharedSink};
use std::sync::Arc;
use tracing::Instrument;

pub struct CommandExecutor {
    broker: Arc<AccessBroker>,
    connection: ConnectionManager,
    retry: RetryPolicy,
    sink: SharedSink,
}

impl CommandExecutor {
    pub fn new(broker: Arc<AccessBroker>, connection: ConnectionManager, sink: SharedSink) -> Self {
        Self {
            broker,
            connection,
            retry: RetryPolicy::default(),
            sink,
        }
    }

    /// Executor whose backoff follows `config.retry`
    pub fn from_config(
        broker: Arc<AccessBroker>,
        connection: ConnectionManager,
        sink: SharedSink,
        config: &ExecConfig,
    ) -> Self {
        Self::new(broker, connection, sink).with_retry(config.retry)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn broker(&self) -> &Arc<AccessBroker> {
        &self.broker
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run `request` to completion
    ///
    /// `Ok` only for exit code 0. Non-zero exits surface as
    /// `ExecutionFailed`; exhausted retries as `RetriesExhausted`.
    pub async fn submit(&self, request: CommandRequest) -> ExecResult<CommandResult> {
        self.submit_with_cancel(request, &CancelToken::new()).await
    }

    /// `submit` that stops as soon as `cancel` fires
    ///
    /// Cancellation asks the helper to stop the in-flight command, releases
    /// every grant and returns `OperationCancelled`. It is never retried.
    pub async fn submit_with_cancel(
        &self,
        request: CommandRequest,
        cancel: &CancelToken,
    ) -> ExecResult<CommandResult> {
        request.validate()?;
        if cancel.is_cancelled() {
            return Err(ExecError::OperationCancelled);
        }

        let id = RequestId::new();
        let span = CommandSpan::new(&request.command, id);

        let outcome = async {
            let broker = Arc::clone(&self.broker);
            let paths = request.resource_paths().to_vec();
            let scope = blocking(move || AccessScope::acquire(&broker, &paths)).await?;
            self.run_attempts(id, &request, scope, cancel, &span).await
        }
        .instrument(span.span().clone())
        .await;

        span.record_outcome(outcome_label(&outcome));
        outcome
    }

    async fn run_attempts(
        &self,
        id: RequestId,
        request: &CommandRequest,
        mut scope: AccessScope,
        cancel: &CancelToken,
        span: &CommandSpan,
    ) -> ExecResult<CommandResult> {
        let mut attempt: u32 = 0;
        let mut lock_retries: u32 = 0;

        loop {
            let attempts_made = attempt + 1;
            span.record_attempts(attempts_made);

            // Grants dropped by an interruption are taken again first
            let (refreshed, renewed) = blocking(move || {
                let renewed = scope.refresh();
                Ok((scope, renewed))
            })
            .await?;
            scope = refreshed;
            if renewed? > 0 {
                self.sink.emit(
                    LogLevel::Info,
                    "grants renewed after reset",
                    &[("request_id", id.to_string())],
                );
            }
            let tokens = scope.tokens();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.abandon(id).await;
                    return Err(ExecError::OperationCancelled);
                }
                result = self.attempt(id, request, tokens) => result,
            };

            let err = match result {
                Ok(result) => {
                    if attempt > 0 {
                        self.sink.emit(
                            LogLevel::Info,
                            "command recovered after retry",
                            &[
                                ("request_id", id.to_string()),
                                ("attempts", attempts_made.to_string()),
                            ],
                        );
                    }
                    return Ok(result);
                }
                Err(err) => err,
            };

            if err.invalidates_connection() {
                self.connection.invalidate(&err.to_string()).await;
                return Err(err);
            }
            if !err.is_transient() {
                return Err(err);
            }
            if err.is_lock_contention() {
                lock_retries += 1;
                if lock_retries > self.retry.lock_retry_limit {
                    return Err(self.exhausted(id, attempts_made, err));
                }
            }
            if attempt >= request.retry_budget {
                return Err(self.exhausted(id, attempts_made, err));
            }

            attempt += 1;
            let delay = self.retry.backoff(attempt);
            self.sink.emit(
                LogLevel::Warn,
                "transient failure, retrying",
                &[
                    ("request_id", id.to_string()),
                    ("attempt", attempts_made.to_string()),
                    ("delay_ms", delay.as_millis().to_string()),
                    ("error", err.to_string()),
                ],
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecError::OperationCancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Exactly one attempt over the current channel
    async fn attempt(
        &self,
        id: RequestId,
        request: &CommandRequest,
        tokens: Vec<CapabilityToken>,
    ) -> ExecResult<CommandResult> {
        let proxy = self.connection.proxy_or_reconnect().await?;
        proxy
            .execute(id, request, tokens, request.timeout)
            .await?
            .into_checked()
    }

    async fn abandon(&self, id: RequestId) {
        if let Ok(proxy) = self.connection.proxy() {
            proxy.cancel(id).await;
        }
        self.sink.emit(
            LogLevel::Info,
            "command cancelled by caller",
            &[("request_id", id.to_string())],
        );
    }

    fn exhausted(&self, id: RequestId, attempts: u32, last: ExecError) -> ExecError {
        self.sink.emit(
            LogLevel::Error,
            "retries exhausted",
            &[
                ("request_id", id.to_string()),
                ("attempts", attempts.to_string()),
                ("error", last.to_string()),
            ],
        );
        ExecError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }

    /// Connected, no leaked grant, and the helper answers on a trusted session
    ///
    /// Leaked grants found here are force-closed, but the check still
    /// reports unhealthy for this round.
    pub async fn perform_health_check(&self) -> bool {
        let connected = self.connection.state().is_connected();

        let grants_ok = self.broker.is_healthy();
        if !grants_ok {
            let swept = self.broker.sweep_expired();
            self.sink.emit(
                LogLevel::Warn,
                "health check found leaked grants",
                &[("swept", swept.len().to_string())],
            );
        }

        let channel_ok = connected && self.connection.verify().await;

        let healthy = connected && grants_ok && channel_ok;
        self.sink.emit(
            if healthy { LogLevel::Debug } else { LogLevel::Warn },
            "health check",
            &[
                ("connected", connected.to_string()),
                ("grants", grants_ok.to_string()),
                ("channel", channel_ok.to_string()),
            ],
        );
        healthy
    }
}

/// Run grant I/O on the blocking pool
async fn blocking<T, F>(work: F) -> ExecResult<T>
where
    F: FnOnce() -> ExecResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ExecError::Io(format!("grant task failed: {e}")))?
}

fn outcome_label(outcome: &ExecResult<CommandResult>) -> &'static str {
    match outcome {
        Ok(_) => "success",
        Err(ExecError::OperationCancelled) => "cancelled",
        Err(ExecError::AccessDenied(_)) => "access_denied",
        Err(ExecError::ExecutionFailed { .. }) => "failed",
        Err(ExecError::RetriesExhausted { .. }) => "retries_exhausted",
        Err(_) => "error",
    }
}
