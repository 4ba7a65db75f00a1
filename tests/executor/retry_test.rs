/*!
 * Retry Policy Tests
 * Attempt bounds, transient vs terminal classification, deadlines
 */

use crate::common::{ok, seed, stack, Outcome, Script};
use pretty_assertions::assert_eq;
use scoped_exec::{CommandRequest, CommandResult, ExecError};
use std::path::PathBuf;
use std::time::Duration;

fn request(budget: u32) -> CommandRequest {
    CommandRequest::new("restic")
        .args(["snapshots", "--json"])
        .with_retry_budget(budget)
        .with_timeout(Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_take_budget_plus_one_attempts() {
    for budget in [0u32, 1, 3] {
        let script = Script::new(|_, _| {
            Outcome::Reply(Err(ExecError::ServiceUnavailable("helper busy".into())))
        });
        let stack = stack(script);
        stack.manager.connect().await.unwrap();

        let err = stack.executor.submit(request(budget)).await.unwrap_err();

        assert_eq!(stack.script.calls(), budget + 1);
        match err {
            ExecError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, budget + 1);
                assert!(matches!(*last, ExecError::ServiceUnavailable(_)));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_exit_code_one_is_not_retried() {
    let script = Script::new(|_, _| Outcome::Reply(Ok(CommandResult::new(1, "", "unknown flag"))));
    let stack = stack(script);
    stack.manager.connect().await.unwrap();

    let err = stack.executor.submit(request(5)).await.unwrap_err();

    assert_eq!(
        err,
        ExecError::ExecutionFailed {
            exit_code: 1,
            stderr: "unknown flag".into()
        }
    );
    assert_eq!(stack.script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_request_from_helper_is_terminal() {
    let script = Script::new(|_, _| {
        Outcome::Reply(Err(ExecError::InvalidRequest("command \"rm\" is not allowed".into())))
    });
    let stack = stack(script);
    stack.manager.connect().await.unwrap();

    let err = stack.executor.submit(request(5)).await.unwrap_err();

    assert!(matches!(err, ExecError::InvalidRequest(_)));
    assert_eq!(stack.script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lock_contention_has_its_own_bound() {
    let script = Script::new(|_, _| {
        Outcome::Reply(Err(ExecError::RepositoryLocked {
            exit_code: 1,
            stderr: "repository is already locked".into(),
        }))
    });
    let stack = stack(script);
    stack.manager.connect().await.unwrap();
    let limit = stack.executor.retry_policy().lock_retry_limit;

    let err = stack.executor.submit(request(10)).await.unwrap_err();

    assert!(matches!(err, ExecError::RetriesExhausted { .. }));
    assert_eq!(stack.script.calls(), limit + 1);
}

#[tokio::test(start_paused = true)]
async fn test_lock_released_between_attempts() {
    let script = Script::new(|call, _| {
        if call == 1 {
            Outcome::Reply(Err(ExecError::RepositoryLocked {
                exit_code: 1,
                stderr: "repository is already locked".into(),
            }))
        } else {
            ok("done")
        }
    });
    let stack = stack(script);
    stack.manager.connect().await.unwrap();

    let result = stack.executor.submit(request(2)).await.unwrap();
    assert_eq!(result.stdout(), "done");
    assert_eq!(stack.script.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_counts_as_transient_and_cancels_remote() {
    let script = Script::new(|_, _| Outcome::Hang);
    let stack = stack(script);
    stack.manager.connect().await.unwrap();

    let err = stack.executor.submit(request(1)).await.unwrap_err();

    match err {
        ExecError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, ExecError::OperationTimeout { elapsed_ms: 1000 }));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(stack.script.cancels().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_between_attempts() {
    let script = Script::new(|_, _| {
        Outcome::Reply(Err(ExecError::ServiceUnavailable("helper busy".into())))
    });
    let stack = stack(script);
    stack.manager.connect().await.unwrap();

    let started = tokio::time::Instant::now();
    let _ = stack.executor.submit(request(3)).await;

    // 10ms base: 20 + 40 + 80
    assert!(started.elapsed() >= Duration::from_millis(140));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_denied_resource_never_reaches_channel() {
    let script = Script::new(|_, _| ok(""));
    let stack = stack(script);
    stack.manager.connect().await.unwrap();
    seed(&stack.store, "/granted");

    let err = stack
        .executor
        .submit(request(3).with_resources(["/granted", "/not-granted"]))
        .await
        .unwrap_err();

    assert_eq!(err, ExecError::AccessDenied(PathBuf::from("/not-granted")));
    assert_eq!(stack.script.calls(), 0);
    assert_eq!(stack.broker.active_count(), 0);
    assert_eq!(stack.platform.begins(), stack.platform.ends());
}

#[tokio::test(start_paused = true)]
async fn test_not_connected_is_retried_then_reported() {
    let script = Script::new(|_, _| ok(""));
    let stack = stack(script);

    let err = stack.executor.submit(request(2)).await.unwrap_err();

    match err {
        ExecError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(*last, ExecError::ConnectionNotEstablished);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(stack.script.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_invalidates_connection() {
    let script = Script::new(|_, _| {
        Outcome::Reply(Err(ExecError::InvalidSession("session expired".into())))
    });
    let stack = stack(script);
    stack.manager.connect().await.unwrap();
    let generation = stack.manager.generation();

    let err = stack.executor.submit(request(3)).await.unwrap_err();

    assert!(matches!(err, ExecError::InvalidSession(_)));
    assert_eq!(stack.script.calls(), 1);
    // One automatic reconnect replaced the distrusted channel
    assert_eq!(stack.connector.connects(), 2);
    assert!(stack.manager.generation() > generation);
}
