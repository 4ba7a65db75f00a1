/*!
 * Connection Manager
 *
 * Sole owner of the channel to the privileged helper and of its
 * `ConnectionState`.
 *
 * - `connect` is idempotent and serialized; the handshake (transport
 *   hello, session check, ping) is bounded by the handshake timeout
 * - A monitor task per channel generation reacts to interruption: state
 *   goes to `Invalidated`, every grant is released through the broker, and
 *   a bounded number of automatic reconnects is attempted
 * - Later recovery is caller-triggered through `proxy_or_reconnect`
 */

use super::proxy::ExecutorProxy;
use super::state::ConnectionState;
use super::traits::{ChannelConnector, SharedChannel};
use crate::access::AccessBroker;
use crate::core::config::ExecConfig;
use crate::core::errors::ExecError;
use crate::core::limits::{DEFAULT_AUTO_RECONNECT_ATTEMPTS, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::core::types::{ExecResult, SessionId};
use crate::monitoring::{LogLevel, SharedSink};
use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

/// Channel together with the generation it was established in
struct Live {
    channel: SharedChannel,
    generation: u64,
}

struct Inner {
    connector: Arc<dyn ChannelConnector>,
    broker: Arc<AccessBroker>,
    sink: SharedSink,
    state: RwLock<ConnectionState>,
    live: ArcSwapOption<Live>,
    generation: AtomicU64,
    connect_lock: Mutex<()>,
    handshake_timeout: Duration,
    auto_reconnect_attempts: u32,
}

/// Cheap to clone; clones share one connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        broker: Arc<AccessBroker>,
        sink: SharedSink,
    ) -> Self {
        Self::with_limits(
            connector,
            broker,
            sink,
            DEFAULT_HANDSHAKE_TIMEOUT,
            DEFAULT_AUTO_RECONNECT_ATTEMPTS,
        )
    }

    pub fn from_config(
        connector: Arc<dyn ChannelConnector>,
        broker: Arc<AccessBroker>,
        sink: SharedSink,
        config: &ExecConfig,
    ) -> Self {
        Self::with_limits(
            connector,
            broker,
            sink,
            config.handshake_timeout,
            config.auto_reconnect_attempts,
        )
    }

    pub fn with_limits(
        connector: Arc<dyn ChannelConnector>,
        broker: Arc<AccessBroker>,
        sink: SharedSink,
        handshake_timeout: Duration,
        auto_reconnect_attempts: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                broker,
                sink,
                state: RwLock::new(ConnectionState::Disconnected),
                live: ArcSwapOption::empty(),
                generation: AtomicU64::new(0),
                connect_lock: Mutex::new(()),
                handshake_timeout,
                auto_reconnect_attempts,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Generation of the current (or last) channel; bumps on every connect
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Session of the live channel, if any
    pub fn session(&self) -> Option<SessionId> {
        self.inner
            .live
            .load_full()
            .map(|live| live.channel.session())
    }

    /// Establish the channel unless already connected
    pub async fn connect(&self) -> ExecResult<()> {
        Inner::connect(&self.inner).await
    }

    /// Proxy over the live channel, `ConnectionNotEstablished` otherwise
    pub fn proxy(&self) -> ExecResult<ExecutorProxy> {
        if !self.state().is_connected() {
            return Err(ExecError::ConnectionNotEstablished);
        }
        match self.inner.live.load_full() {
            Some(live) => Ok(ExecutorProxy::new(Arc::clone(&live.channel), live.generation)),
            None => Err(ExecError::ConnectionNotEstablished),
        }
    }

    /// `proxy`, reconnecting first when the last channel was lost
    ///
    /// An explicit `shutdown` is respected: a disconnected manager is not
    /// brought back here.
    pub async fn proxy_or_reconnect(&self) -> ExecResult<ExecutorProxy> {
        if let Some(live) = self.inner.live.load_full() {
            if live.channel.is_closed() {
                Inner::interrupted(&self.inner, live.generation, "channel closed").await;
            }
        }

        match self.state() {
            ConnectionState::Connected => self.proxy(),
            ConnectionState::Invalidated | ConnectionState::Connecting => {
                self.connect().await?;
                self.proxy()
            }
            ConnectionState::Disconnected => Err(ExecError::ConnectionNotEstablished),
        }
    }

    /// Drop the current channel after a session-level failure
    pub async fn invalidate(&self, reason: &str) {
        let generation = self.generation();
        Inner::interrupted(&self.inner, generation, reason).await;
    }

    /// Liveness and identity check of the live channel
    pub async fn verify(&self) -> bool {
        let proxy = match self.proxy() {
            Ok(proxy) => proxy,
            Err(_) => return false,
        };
        if proxy.session().is_default() {
            return false;
        }
        matches!(
            tokio::time::timeout(self.inner.handshake_timeout, proxy.ping()).await,
            Ok(Ok(()))
        )
    }

    /// Force `Disconnected` and release the channel
    pub async fn shutdown(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        *self.inner.state.write() = ConnectionState::Disconnected;
        // Outdate the monitor of the channel being closed
        self.inner.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(live) = self.inner.live.swap(None) {
            live.channel.close().await;
        }
        self.inner
            .sink
            .emit(LogLevel::Info, "connection shut down", &[]);
    }
}

impl Inner {
    async fn connect(this: &Arc<Self>) -> ExecResult<()> {
        let _guard = this.connect_lock.lock().await;

        if this.state.read().is_connected() {
            if let Some(live) = this.live.load_full() {
                if !live.channel.is_closed() {
                    return Ok(());
                }
            }
        }

        let recovering = {
            let mut state = this.state.write();
            let recovering = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Connecting;
            recovering
        };
        this.sink.emit(LogLevel::Debug, "connecting to helper", &[]);

        let outcome = match tokio::time::timeout(this.handshake_timeout, this.handshake()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecError::ServiceUnavailable(format!(
                "handshake did not complete within {}ms",
                this.handshake_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(channel) => {
                let generation = this.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let session = channel.session();
                this.live.store(Some(Arc::new(Live {
                    channel: Arc::clone(&channel),
                    generation,
                })));
                *this.state.write() = ConnectionState::Connected;

                tokio::spawn(monitor(Arc::downgrade(this), channel, generation));
                this.sink.emit(
                    LogLevel::Info,
                    "connected to helper",
                    &[
                        ("session", session.to_string()),
                        ("generation", generation.to_string()),
                    ],
                );
                Ok(())
            }
            Err(err) => {
                *this.state.write() = if recovering {
                    ConnectionState::Invalidated
                } else {
                    ConnectionState::Disconnected
                };
                this.sink.emit(
                    LogLevel::Warn,
                    "connect failed",
                    &[("error", err.to_string())],
                );
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> ExecResult<SharedChannel> {
        let channel = self.connector.connect().await?;

        if channel.session().is_default() {
            channel.close().await;
            return Err(ExecError::InvalidSession(
                "helper presented the default session".into(),
            ));
        }

        if let Err(err) = channel.ping().await {
            channel.close().await;
            return Err(ExecError::ServiceUnavailable(format!(
                "liveness ping failed: {err}"
            )));
        }

        Ok(channel)
    }

    /// Handle loss of the channel established in `generation`
    ///
    /// Boxed: it reconnects, and every connect spawns a monitor that
    /// comes back here.
    fn interrupted<'a>(
        this: &'a Arc<Self>,
        generation: u64,
        reason: &'a str,
    ) -> BoxFuture<'a, ()> {
        async move {
            {
                let mut state = this.state.write();
                let is_current = this
                    .live
                    .load_full()
                    .map_or(false, |live| live.generation == generation);
                if !is_current || !state.is_connected() {
                    return;
                }
                *state = ConnectionState::Invalidated;
            }

            if let Some(live) = this.live.swap(None) {
                live.channel.close().await;
            }
            let released = this.broker.release_all();
            this.sink.emit(
                LogLevel::Warn,
                "connection interrupted",
                &[
                    ("reason", reason.to_string()),
                    ("released_grants", released.to_string()),
                ],
            );

            for attempt in 1..=this.auto_reconnect_attempts {
                match Self::connect(this).await {
                    Ok(()) => return,
                    Err(err) => this.sink.emit(
                        LogLevel::Warn,
                        "automatic reconnect failed",
                        &[("attempt", attempt.to_string()), ("error", err.to_string())],
                    ),
                }
            }
        }
        .boxed()
    }
}

async fn monitor(inner: Weak<Inner>, channel: SharedChannel, generation: u64) {
    channel.closed().await;
    drop(channel);
    if let Some(inner) = inner.upgrade() {
        Inner::interrupted(&inner, generation, "transport closed").await;
    }
}
