/*!
 * Backup Scenario Tests
 * Facade calls driven through the full client stack
 */

use crate::common::{ok, seed, stack, Outcome, Script};
use pretty_assertions::assert_eq;
use scoped_exec::{BackupClient, ConnectionState, ExecConfig, ExecError};
use std::path::{Path, PathBuf};

const SOURCE: &str = "/Users/x/Documents";
const REPOSITORY: &str = "/Volumes/Backup/repo";

fn client(stack: &crate::common::Stack) -> BackupClient {
    BackupClient::new(stack.executor.clone(), stack.vault.clone(), &ExecConfig::new())
}

#[tokio::test(start_paused = true)]
async fn test_backup_succeeds_and_leaves_no_grant() {
    let stack = stack(Script::new(|_, _| ok("{\"message_type\":\"summary\"}")));
    seed(&stack.store, SOURCE);
    seed(&stack.store, REPOSITORY);
    stack.manager.connect().await.unwrap();

    let result = client(&stack)
        .backup(&[PathBuf::from(SOURCE)], Path::new(REPOSITORY))
        .await
        .unwrap();

    assert_eq!(result.exit_code(), 0);
    assert_eq!(stack.broker.active_count(), 0);
    assert_eq!(stack.platform.begins(), 2);
    assert_eq!(stack.platform.ends(), 2);

    let envelope = &stack.script.envelopes()[0];
    assert_eq!(envelope.command, "restic");
    assert_eq!(
        envelope.args,
        vec!["backup", "--repo", REPOSITORY, "--json", SOURCE]
    );
    assert_eq!(envelope.capabilities.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_password_travels_in_environment() {
    let stack = stack(Script::new(|_, _| ok("")));
    seed(&stack.store, REPOSITORY);
    stack.manager.connect().await.unwrap();
    let client = client(&stack);

    client
        .set_repository_password(Path::new(REPOSITORY), "hunter2")
        .unwrap();
    client
        .initialize_repository(Path::new(REPOSITORY))
        .await
        .unwrap();

    let envelope = &stack.script.envelopes()[0];
    assert_eq!(
        envelope.env.get("RESTIC_PASSWORD").map(String::as_str),
        Some("hunter2")
    );
    assert!(!envelope.args.iter().any(|arg| arg.contains("hunter2")));
}

#[tokio::test(start_paused = true)]
async fn test_interruption_recovered_on_second_attempt() {
    let stack = stack(Script::new(|call, _| {
        if call == 1 {
            Outcome::Interrupt
        } else {
            ok("{}")
        }
    }));
    seed(&stack.store, SOURCE);
    seed(&stack.store, REPOSITORY);
    stack.manager.connect().await.unwrap();

    let result = client(&stack)
        .backup(&[PathBuf::from(SOURCE)], Path::new(REPOSITORY))
        .await
        .unwrap();

    assert_eq!(result.exit_code(), 0);
    assert_eq!(stack.script.calls(), 2);
    assert_eq!(stack.connector.connects(), 2);
    assert_eq!(stack.manager.state(), ConnectionState::Connected);

    // Released by the interruption, taken again for the retry
    assert_eq!(stack.platform.begins(), 4);
    assert_eq!(stack.platform.ends(), 4);
    assert_eq!(stack.broker.active_count(), 0);
    assert_eq!(stack.sink.matching("grants renewed after reset").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_list_snapshots_parses_output() {
    let stack = stack(Script::new(|_, _| {
        ok(r#"[
            {"id":"bbbb0000","short_id":"bbbb","time":"2024-03-02T10:00:00Z","hostname":"mac","paths":["/Users/x/Documents"]},
            {"id":"aaaa0000","short_id":"aaaa","time":"2024-03-01T10:00:00Z","hostname":"mac","paths":["/Users/x/Documents"],"tags":["daily"]}
        ]"#)
    }));
    seed(&stack.store, REPOSITORY);
    stack.manager.connect().await.unwrap();

    let snapshots = client(&stack)
        .list_snapshots(Path::new(REPOSITORY))
        .await
        .unwrap();

    let ids: Vec<_> = snapshots.iter().map(|s| s.short_id.as_str()).collect();
    assert_eq!(ids, vec!["aaaa", "bbbb"]);
    assert_eq!(snapshots[0].tags, vec!["daily".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_restore_rejects_option_like_snapshot_id() {
    let stack = stack(Script::new(|_, _| ok("")));
    stack.manager.connect().await.unwrap();

    let err = client(&stack)
        .restore(Path::new(REPOSITORY), "--target=/", Path::new("/tmp/out"))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::InvalidRequest(_)));
    assert_eq!(stack.script.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backup_without_grant_is_denied() {
    let stack = stack(Script::new(|_, _| ok("")));
    seed(&stack.store, REPOSITORY);
    stack.manager.connect().await.unwrap();

    let err = client(&stack)
        .backup(&[PathBuf::from(SOURCE)], Path::new(REPOSITORY))
        .await
        .unwrap_err();

    assert_eq!(err, ExecError::AccessDenied(PathBuf::from(SOURCE)));
    assert_eq!(stack.script.calls(), 0);
    assert_eq!(stack.platform.active(), 0);
}
