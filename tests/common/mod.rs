/*!
 * Shared test fixtures
 * Counting capability platform, scripted helper channel, assembled stack
 */

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use scoped_exec::capability::{CapabilityResult, Resolution};
use scoped_exec::protocol::CommandEnvelope;
use scoped_exec::{
    AccessBroker, CapabilityError, CapabilityPlatform, CapabilityStore, CapabilityToken,
    ChannelConnector, CommandExecutor, CommandResult, ConnectionManager, ExecError, ExecResult,
    ExecutionChannel, MemorySink, MemoryVault, RequestId, ResourceHandle, ResourceKey,
    RetryPolicy, SessionId, SharedChannel, SharedPlatform,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Platform double counting begin/end calls
///
/// Token bytes are `<path>#<serial>`; bytes starting with `corrupt` fail to
/// resolve.
#[derive(Default)]
pub struct CountingPlatform {
    begins: AtomicUsize,
    ends: AtomicUsize,
    issued: AtomicUsize,
    stale: Mutex<HashSet<Vec<u8>>>,
    denied: Mutex<HashSet<PathBuf>>,
    begin_delay: Mutex<Option<Duration>>,
}

impl CountingPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.begins() - self.ends()
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn mark_stale(&self, bytes: &[u8]) {
        self.stale.lock().insert(bytes.to_vec());
    }

    pub fn deny(&self, path: impl Into<PathBuf>) {
        self.denied.lock().insert(path.into());
    }

    pub fn slow_begin(&self, delay: Duration) {
        *self.begin_delay.lock() = Some(delay);
    }
}

impl CapabilityPlatform for CountingPlatform {
    fn issue_token(&self, path: &Path, _read_only: bool) -> CapabilityResult<Vec<u8>> {
        let serial = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}#{serial}", path.display()).into_bytes())
    }

    fn resolve_token(&self, bytes: &[u8]) -> CapabilityResult<Resolution> {
        let text = String::from_utf8_lossy(bytes);
        if text.starts_with("corrupt") {
            return Err(CapabilityError::Corrupt {
                path: PathBuf::new(),
                reason: "unreadable test token".into(),
            });
        }
        let path = text.split('#').next().unwrap_or_default().to_string();
        Ok(Resolution {
            handle: ResourceHandle {
                key: ResourceKey::new(&path),
                target: PathBuf::from(&path),
                read_only: false,
            },
            is_stale: self.stale.lock().contains(bytes),
        })
    }

    fn begin_access(&self, handle: &ResourceHandle) -> bool {
        if self.denied.lock().contains(&handle.target) {
            return false;
        }
        if let Some(delay) = *self.begin_delay.lock() {
            std::thread::sleep(delay);
        }
        self.begins.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn end_access(&self, _handle: &ResourceHandle) {
        self.ends.fetch_add(1, Ordering::SeqCst);
    }
}

/// Persist a token for `path` that the counting platform resolves
pub fn seed(store: &CapabilityStore, path: &str) -> CapabilityToken {
    let token = CapabilityToken::new(
        ResourceKey::new(path),
        format!("{path}#seed").into_bytes(),
        false,
    );
    store.save(&token).unwrap();
    token
}

/// What the scripted channel does for one `execute` call
pub enum Outcome {
    Reply(ExecResult<CommandResult>),
    /// Drop the transport mid-call
    Interrupt,
    /// Never answer
    Hang,
}

pub fn ok(stdout: &str) -> Outcome {
    Outcome::Reply(Ok(CommandResult::new(0, stdout, "")))
}

type Behavior = Box<dyn Fn(u32, &CommandEnvelope) -> Outcome + Send + Sync>;

/// Behaviour and call log shared by every channel a connector hands out
pub struct Script {
    behavior: Behavior,
    calls: AtomicU32,
    envelopes: Mutex<Vec<CommandEnvelope>>,
    cancels: Mutex<Vec<RequestId>>,
    ping_fails: AtomicBool,
}

impl Script {
    /// `behavior` gets the 1-based call number across all channels
    pub fn new(behavior: impl Fn(u32, &CommandEnvelope) -> Outcome + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: AtomicU32::new(0),
            envelopes: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            ping_fails: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn envelopes(&self) -> Vec<CommandEnvelope> {
        self.envelopes.lock().clone()
    }

    pub fn cancels(&self) -> Vec<RequestId> {
        self.cancels.lock().clone()
    }

    pub fn fail_pings(&self, fail: bool) {
        self.ping_fails.store(fail, Ordering::SeqCst);
    }
}

pub struct FakeChannel {
    session: SessionId,
    closed: watch::Sender<bool>,
    script: Arc<Script>,
}

impl FakeChannel {
    fn shut(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl ExecutionChannel for FakeChannel {
    fn session(&self) -> SessionId {
        self.session
    }

    async fn ping(&self) -> ExecResult<()> {
        if self.is_closed() {
            return Err(ExecError::ConnectionInterrupted("closed".into()));
        }
        if self.script.ping_fails.load(Ordering::SeqCst) {
            return Err(ExecError::ServiceUnavailable("ping refused".into()));
        }
        Ok(())
    }

    async fn execute(&self, envelope: CommandEnvelope) -> ExecResult<CommandResult> {
        if self.is_closed() {
            return Err(ExecError::ConnectionInterrupted("closed".into()));
        }
        let call = self.script.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.envelopes.lock().push(envelope.clone());

        match (self.script.behavior)(call, &envelope) {
            Outcome::Reply(result) => result,
            Outcome::Interrupt => {
                self.shut();
                Err(ExecError::ConnectionInterrupted("transport dropped".into()))
            }
            Outcome::Hang => std::future::pending().await,
        }
    }

    async fn cancel(&self, id: RequestId) {
        self.script.cancels.lock().push(id);
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn close(&self) {
        self.shut();
    }
}

/// Connector handing out scripted channels
pub struct FakeConnector {
    script: Arc<Script>,
    connects: AtomicU32,
    unavailable: AtomicBool,
    default_session: AtomicBool,
    delay: Mutex<Option<Duration>>,
    last: Mutex<Option<Arc<FakeChannel>>>,
}

impl FakeConnector {
    pub fn new(script: Arc<Script>) -> Arc<Self> {
        Arc::new(Self {
            script,
            connects: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            default_session: AtomicBool::new(false),
            delay: Mutex::new(None),
            last: Mutex::new(None),
        })
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn present_default_session(&self, yes: bool) {
        self.default_session.store(yes, Ordering::SeqCst);
    }

    pub fn delay_connect(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Simulate the helper going away under the current channel
    pub fn drop_current(&self) {
        if let Some(channel) = self.last.lock().as_ref() {
            channel.shut();
        }
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self) -> ExecResult<SharedChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ExecError::ServiceUnavailable("no helper".into()));
        }

        let session = if self.default_session.load(Ordering::SeqCst) {
            SessionId::nil()
        } else {
            SessionId::generate()
        };
        let (closed, _) = watch::channel(false);
        let channel = Arc::new(FakeChannel {
            session,
            closed,
            script: Arc::clone(&self.script),
        });
        *self.last.lock() = Some(Arc::clone(&channel));
        Ok(channel)
    }
}

/// Fully wired client side over fakes
pub struct Stack {
    pub platform: Arc<CountingPlatform>,
    pub sink: Arc<MemorySink>,
    pub vault: Arc<MemoryVault>,
    pub store: Arc<CapabilityStore>,
    pub broker: Arc<AccessBroker>,
    pub script: Arc<Script>,
    pub connector: Arc<FakeConnector>,
    pub manager: ConnectionManager,
    pub executor: Arc<CommandExecutor>,
}

pub fn stack(script: Arc<Script>) -> Stack {
    stack_with_grant_limit(script, Duration::from_secs(300))
}

pub fn stack_with_grant_limit(script: Arc<Script>, max_duration: Duration) -> Stack {
    let platform = CountingPlatform::new();
    let shared: SharedPlatform = platform.clone();
    let sink = Arc::new(MemorySink::default());
    let vault = Arc::new(MemoryVault::new());
    let store = Arc::new(CapabilityStore::new(vault.clone(), shared.clone(), sink.clone()));
    let broker = Arc::new(AccessBroker::with_max_duration(
        store.clone(),
        shared,
        sink.clone(),
        max_duration,
    ));
    let connector = FakeConnector::new(Arc::clone(&script));
    let manager = ConnectionManager::with_limits(
        connector.clone(),
        broker.clone(),
        sink.clone(),
        Duration::from_millis(500),
        1,
    );
    let executor = Arc::new(
        CommandExecutor::new(broker.clone(), manager.clone(), sink.clone())
            .with_retry(RetryPolicy::new(Duration::from_millis(10))),
    );

    Stack {
        platform,
        sink,
        vault,
        store,
        broker,
        script,
        connector,
        manager,
        executor,
    }
}

/// Poll `condition` until it holds or a second has passed
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
