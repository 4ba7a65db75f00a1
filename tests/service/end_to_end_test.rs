/*!
 * End-to-end Tests
 * Real helper service on a Unix socket, real child processes
 */

use crate::common::eventually;
use pretty_assertions::assert_eq;
use scoped_exec::{
    AccessBroker, CancelToken, CapabilityStore, CommandExecutor, CommandRequest, CommandRunner,
    ConnectionManager, ConnectionState, ExecConfig, ExecError, ExecutionService, MemorySink,
    MemoryVault, PathCapabilityPlatform, RetryPolicy, SessionId, SessionValidator, UnixChannel,
    UnixConnector,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

struct Harness {
    _dir: TempDir,
    data: PathBuf,
    socket: PathBuf,
    helper_platform: Arc<PathCapabilityPlatform>,
    client_platform: Arc<PathCapabilityPlatform>,
    broker: Arc<AccessBroker>,
    manager: ConnectionManager,
    executor: CommandExecutor,
    shutdown: CancelToken,
    server: JoinHandle<scoped_exec::ExecResult<()>>,
}

async fn harness() -> Harness {
    harness_with(|service| service).await
}

async fn harness_with(
    customize: impl FnOnce(ExecutionService) -> ExecutionService,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    let socket = dir.path().join("helper.sock");

    let mut config = ExecConfig::new()
        .with_socket_path(&socket)
        .with_handshake_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::new(Duration::from_millis(10)));
    config.allowed_commands = vec!["sh".to_string()];

    let helper_platform = Arc::new(PathCapabilityPlatform::new());
    let runner = CommandRunner::new(config.allowed_commands.clone(), helper_platform.clone())
        .with_grace(Duration::from_millis(100));
    let service = customize(
        ExecutionService::new(&config, helper_platform.clone()).with_runner(runner),
    );
    let listener = service.bind().unwrap();
    let shutdown = CancelToken::new();
    let server = tokio::spawn(Arc::new(service).serve(listener, shutdown.clone()));

    let client_platform = Arc::new(PathCapabilityPlatform::new());
    let sink = Arc::new(MemorySink::default());
    let store = Arc::new(CapabilityStore::new(
        Arc::new(MemoryVault::new()),
        client_platform.clone(),
        sink.clone(),
    ));
    store.register(&data, false).unwrap();
    let broker = Arc::new(AccessBroker::from_config(
        store,
        client_platform.clone(),
        sink.clone(),
        &config,
    ));
    let manager = ConnectionManager::from_config(
        Arc::new(UnixConnector::new(&socket)),
        broker.clone(),
        sink.clone(),
        &config,
    );
    let executor = CommandExecutor::from_config(broker.clone(), manager.clone(), sink, &config);

    Harness {
        _dir: dir,
        data,
        socket,
        helper_platform,
        client_platform,
        broker,
        manager,
        executor,
        shutdown,
        server,
    }
}

fn shell(script: &str) -> CommandRequest {
    CommandRequest::new("sh")
        .args(["-c", script])
        .with_retry_budget(0)
        .with_timeout(Duration::from_secs(10))
}

#[tokio::test]
async fn test_command_runs_with_granted_resource() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    let result = h
        .executor
        .submit(
            shell("ls; echo done >&2")
                .with_working_dir(&h.data)
                .with_resource(&h.data),
        )
        .await
        .unwrap();

    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stderr(), "done\n");
    assert_eq!(h.broker.active_count(), 0);
    assert_eq!(h.client_platform.active_count(), 0);
    assert_eq!(h.helper_platform.active_count(), 0);
}

#[tokio::test]
async fn test_environment_is_request_only() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    // HOME is set for the test process but must not reach the child
    let result = h
        .executor
        .submit(shell("echo \"$GREETING:${HOME:-clean}\"").with_env("GREETING", "hi"))
        .await
        .unwrap();

    assert_eq!(result.stdout(), "hi:clean\n");
}

#[tokio::test]
async fn test_non_zero_exit_is_reported() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    let err = h
        .executor
        .submit(shell("echo nope >&2; exit 3"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExecError::ExecutionFailed {
            exit_code: 3,
            stderr: "nope\n".into()
        }
    );
}

#[tokio::test]
async fn test_large_output_is_delivered_truncated() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    let started = std::time::Instant::now();
    let result = h
        .executor
        .submit(
            shell("head -c 17000000 /dev/zero | tr '\\0' a; echo; echo summary")
                .with_timeout(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(result.stdout().starts_with('['));
    assert!(result.stdout().contains("earlier bytes truncated"));
    assert!(result.stdout().ends_with("\nsummary\n"));
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_lock_contention_is_classified() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    let err = h
        .executor
        .submit(shell("echo 'unable to create lock: repository is already locked' >&2; exit 1"))
        .await
        .unwrap_err();

    match err {
        ExecError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, ExecError::RepositoryLocked { exit_code: 1, .. }));
        }
        other => panic!("expected lock contention, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disallowed_command_is_refused() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    let err = h
        .executor
        .submit(CommandRequest::new("rm").args(["-rf", "/"]))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_cancel_stops_remote_command() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = h
        .executor
        .submit_with_cancel(shell("sleep 30").with_resource(&h.data), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err, ExecError::OperationCancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.broker.active_count(), 0);
    assert!(eventually(|| h.helper_platform.active_count() == 0).await);
}

#[tokio::test]
async fn test_deadline_stops_remote_command() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    let err = h
        .executor
        .submit(shell("sleep 30").with_timeout(Duration::from_millis(300)))
        .await
        .unwrap_err();

    match err {
        ExecError::RetriesExhausted { last, .. } => {
            assert!(matches!(*last, ExecError::OperationTimeout { .. }));
        }
        other => panic!("expected deadline, got {other:?}"),
    }
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_default_client_session_is_rejected() {
    let h = harness().await;

    let stream = UnixStream::connect(&h.socket).await.unwrap();
    let err = UnixChannel::handshake(stream, SessionId::nil()).await.unwrap_err();

    assert!(matches!(err, ExecError::InvalidSession(_)));
}

#[tokio::test]
async fn test_foreign_peer_is_rejected() {
    let h = harness_with(|service| {
        let uid = nix::unistd::getuid().as_raw();
        service.with_validator(SessionValidator::for_uid(uid.wrapping_add(1)))
    })
    .await;

    let err = h.manager.connect().await.unwrap_err();

    assert!(matches!(err, ExecError::InvalidSession(_)));
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_helper_shutdown_invalidates_client() {
    let h = harness().await;
    h.manager.connect().await.unwrap();

    h.shutdown.cancel();
    h.server.await.unwrap().unwrap();

    assert!(!h.socket.exists());
    assert!(eventually(|| h.manager.state() == ConnectionState::Invalidated).await);
    assert!(!h.executor.perform_health_check().await);
}
