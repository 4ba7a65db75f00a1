/*!
 * Configuration Wiring Tests
 * Environment overrides must reach the broker and the executor
 */

use crate::common::{ok, seed, CountingPlatform, FakeConnector, Script};
use pretty_assertions::assert_eq;
use scoped_exec::{
    AccessBroker, CapabilityStore, CommandExecutor, ConnectionManager, ExecConfig, MemorySink,
    MemoryVault, SharedPlatform,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

#[test]
#[serial]
fn test_environment_overrides_reach_broker_and_executor() {
    std::env::set_var("SCOPED_EXEC_GRANT_MAX_SECS", "42");
    std::env::set_var("SCOPED_EXEC_RETRY_BASE_MS", "250");
    let config = ExecConfig::from_env();
    std::env::remove_var("SCOPED_EXEC_GRANT_MAX_SECS");
    std::env::remove_var("SCOPED_EXEC_RETRY_BASE_MS");
    let config = config.unwrap();

    let platform = CountingPlatform::new();
    let shared: SharedPlatform = platform.clone();
    let sink = Arc::new(MemorySink::default());
    let store = Arc::new(CapabilityStore::new(
        Arc::new(MemoryVault::new()),
        shared.clone(),
        sink.clone(),
    ));
    seed(&store, "/Users/x/Documents");

    let broker = Arc::new(AccessBroker::from_config(store, shared, sink.clone(), &config));
    let manager = ConnectionManager::from_config(
        FakeConnector::new(Script::new(|_, _| ok(""))),
        broker.clone(),
        sink.clone(),
        &config,
    );
    let executor = CommandExecutor::from_config(broker.clone(), manager, sink, &config);

    assert!(broker.retain("/Users/x/Documents").unwrap());
    assert_eq!(broker.grants()[0].max_duration, Duration::from_secs(42));
    broker.release("/Users/x/Documents");

    assert_eq!(executor.retry_policy().base, Duration::from_millis(250));
    assert_eq!(executor.retry_policy().backoff(1), Duration::from_millis(500));
}
