/*!
 * Access Broker
 *
 * Start/stop lifecycle over capability-backed resources.
 *
 * - At most one grant per resource key; re-entrant starts short-circuit
 * - Stale tokens are re-issued and persisted before access begins
 * - Ordinary denial is a `false` return; only broken capability data errors
 * - Grants are opened one at a time under a dedicated opener lock, so the
 *   platform sees a single begin/end pair per grant no matter how many
 *   callers race. Token I/O never runs under the grant map lock
 * - A plain start and counted retains are separate holders of one grant;
 *   access ends only when none of them remains
 * - `release_all` bumps the broker epoch; counted holders from an older
 *   epoch no longer own anything and their releases are ignored
 */

use super::grant::{ActiveGrant, GrantInfo};
use crate::capability::{
    CapabilityError, CapabilityResult, CapabilityStore, CapabilityToken, SharedPlatform,
};
use crate::core::config::ExecConfig;
use crate::core::limits::DEFAULT_GRANT_MAX_DURATION;
use crate::core::types::ResourceKey;
use crate::monitoring::{LogLevel, SharedSink};
use ahash::RandomState;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type GrantMap = HashMap<ResourceKey, ActiveGrant, RandomState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Started,
    Counted,
}

pub struct AccessBroker {
    grants: RwLock<GrantMap>,
    /// Serializes grant opening; held across token I/O instead of `grants`
    opening: Mutex<()>,
    /// Bumped under the write lock by `release_all`
    epoch: AtomicU64,
    store: Arc<CapabilityStore>,
    platform: SharedPlatform,
    max_duration: Duration,
    sink: SharedSink,
}

impl AccessBroker {
    pub fn new(store: Arc<CapabilityStore>, platform: SharedPlatform, sink: SharedSink) -> Self {
        Self::with_max_duration(store, platform, sink, DEFAULT_GRANT_MAX_DURATION)
    }

    /// Broker whose grant lease follows `config.grant_max_duration`
    pub fn from_config(
        store: Arc<CapabilityStore>,
        platform: SharedPlatform,
        sink: SharedSink,
        config: &ExecConfig,
    ) -> Self {
        Self::with_max_duration(store, platform, sink, config.grant_max_duration)
    }

    pub fn with_max_duration(
        store: Arc<CapabilityStore>,
        platform: SharedPlatform,
        sink: SharedSink,
        max_duration: Duration,
    ) -> Self {
        Self {
            grants: RwLock::new(GrantMap::default()),
            opening: Mutex::new(()),
            epoch: AtomicU64::new(0),
            store,
            platform,
            max_duration,
            sink,
        }
    }

    pub fn store(&self) -> &Arc<CapabilityStore> {
        &self.store
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Begin access to `path`
    ///
    /// Returns `Ok(true)` when a grant is (or already was) open, `Ok(false)`
    /// on denial, and an error only for corrupt or unreadable capabilities.
    pub fn start_accessing(&self, path: impl AsRef<Path>) -> CapabilityResult<bool> {
        let key = ResourceKey::new(path);
        self.acquire(&key, Holder::Started).map(|epoch| epoch.is_some())
    }

    /// End the plain start on `path`
    ///
    /// A missing grant is logged and ignored. Platform access stays open
    /// while counted holders remain.
    pub fn stop_accessing(&self, path: impl AsRef<Path>) {
        let key = ResourceKey::new(path);
        let mut grants = self.grants.write();

        let idle = match grants.get_mut(&key) {
            Some(grant) if grant.started => {
                grant.started = false;
                Some(grant.is_idle())
            }
            _ => None,
        };

        match idle {
            Some(true) => self.remove_and_close(grants, &key),
            Some(false) => {
                drop(grants);
                self.sink.emit(
                    LogLevel::Debug,
                    "access kept open for counted holders",
                    &[("path", key.to_string())],
                );
            }
            None => {
                drop(grants);
                self.sink.emit(
                    LogLevel::Debug,
                    "stop_accessing without an active grant",
                    &[("path", key.to_string())],
                );
            }
        }
    }

    /// Counted variant of `start_accessing` for overlapping users
    ///
    /// Each successful `retain` must be paired with one `release`; the
    /// platform access ends when the last holder releases.
    pub fn retain(&self, path: impl AsRef<Path>) -> CapabilityResult<bool> {
        self.retain_in_epoch(path).map(|epoch| epoch.is_some())
    }

    /// `retain` that also reports the epoch the holder belongs to
    ///
    /// `Ok(None)` is a denial.
    pub fn retain_in_epoch(&self, path: impl AsRef<Path>) -> CapabilityResult<Option<u64>> {
        let key = ResourceKey::new(path);
        self.acquire(&key, Holder::Counted)
    }

    /// Drop one holder taken with `retain`
    pub fn release(&self, path: impl AsRef<Path>) {
        let key = ResourceKey::new(path);
        let grants = self.grants.write();
        self.release_locked(grants, key);
    }

    /// Drop one holder taken in `epoch`; a no-op once `release_all` ran
    pub fn release_in_epoch(&self, path: impl AsRef<Path>, epoch: u64) {
        let key = ResourceKey::new(path);
        let grants = self.grants.write();
        if self.epoch.load(Ordering::Acquire) != epoch {
            drop(grants);
            self.sink.emit(
                LogLevel::Debug,
                "release after grants were reset",
                &[("path", key.to_string()), ("epoch", epoch.to_string())],
            );
            return;
        }
        self.release_locked(grants, key);
    }

    /// Join an open grant, or open one with token I/O outside the map lock
    fn acquire(&self, key: &ResourceKey, holder: Holder) -> CapabilityResult<Option<u64>> {
        if let Some(epoch) = self.join(key, holder) {
            return Ok(Some(epoch));
        }

        let _opening = self.opening.lock();
        // Another opener may have finished while we waited
        if let Some(epoch) = self.join(key, holder) {
            return Ok(Some(epoch));
        }

        match self.open_grant(key) {
            Ok(mut grant) => {
                let mut grants = self.grants.write();
                add_holder(&mut grant, holder);
                grants.insert(key.clone(), grant);
                Ok(Some(self.epoch.load(Ordering::Acquire)))
            }
            Err(err) => self.denied_or_raise(key, err).map(|_| None),
        }
    }

    fn join(&self, key: &ResourceKey, holder: Holder) -> Option<u64> {
        let mut grants = self.grants.write();
        let grant = grants.get_mut(key)?;
        add_holder(grant, holder);
        Some(self.epoch.load(Ordering::Acquire))
    }

    fn release_locked(&self, mut grants: RwLockWriteGuard<'_, GrantMap>, key: ResourceKey) {
        let idle = match grants.get_mut(&key) {
            Some(grant) if grant.holders > 0 => {
                grant.holders -= 1;
                Some(grant.is_idle())
            }
            _ => None,
        };

        match idle {
            Some(true) => self.remove_and_close(grants, &key),
            Some(false) => {}
            None => {
                drop(grants);
                self.sink.emit(
                    LogLevel::Debug,
                    "release without an active grant",
                    &[("path", key.to_string())],
                );
            }
        }
    }

    fn remove_and_close(&self, mut grants: RwLockWriteGuard<'_, GrantMap>, key: &ResourceKey) {
        let removed = grants.remove(key);
        drop(grants);
        if let Some(grant) = removed {
            self.close_grant(&grant);
        }
    }

    /// Current grant epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// False when some grant outlived its lease
    pub fn is_healthy(&self) -> bool {
        self.grants.read().values().all(|g| !g.is_expired())
    }

    /// Force-close grants that outlived their lease
    pub fn sweep_expired(&self) -> Vec<ResourceKey> {
        let expired: Vec<ActiveGrant> = {
            let mut grants = self.grants.write();
            let keys: Vec<ResourceKey> = grants
                .values()
                .filter(|g| g.is_expired())
                .map(|g| g.key.clone())
                .collect();
            keys.iter().filter_map(|k| grants.remove(k)).collect()
        };

        for grant in &expired {
            self.sink.emit(
                LogLevel::Warn,
                "leaked grant force-closed",
                &[
                    ("path", grant.key.to_string()),
                    ("age_ms", grant.age().as_millis().to_string()),
                ],
            );
            self.platform.end_access(&grant.handle);
        }
        expired.into_iter().map(|g| g.key).collect()
    }

    /// Close every grant, used when the channel is lost
    pub fn release_all(&self) -> usize {
        let drained: Vec<ActiveGrant> = {
            let mut grants = self.grants.write();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            grants.drain().map(|(_, g)| g).collect()
        };
        for grant in &drained {
            self.platform.end_access(&grant.handle);
        }
        if !drained.is_empty() {
            self.sink.emit(
                LogLevel::Info,
                "released all grants",
                &[("count", drained.len().to_string())],
            );
        }
        drained.len()
    }

    pub fn has_grant(&self, path: impl AsRef<Path>) -> bool {
        self.grants.read().contains_key(&ResourceKey::new(path))
    }

    /// Token snapshot held by the open grant for `path`
    pub fn token(&self, path: impl AsRef<Path>) -> Option<CapabilityToken> {
        self.grants
            .read()
            .get(&ResourceKey::new(path))
            .map(|g| g.token.clone())
    }

    pub fn active_count(&self) -> usize {
        self.grants.read().len()
    }

    pub fn grants(&self) -> Vec<GrantInfo> {
        let mut infos: Vec<GrantInfo> = self.grants.read().values().map(ActiveGrant::info).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Load, refresh if stale, resolve, and begin platform access
    fn open_grant(&self, key: &ResourceKey) -> CapabilityResult<ActiveGrant> {
        let mut token = self.store.load(key)?;
        let mut resolution = self.store.resolve(&token)?;

        if resolution.is_stale {
            self.sink.emit(
                LogLevel::Info,
                "renewing stale capability",
                &[("path", key.to_string())],
            );
            token = self.store.issue(key, token.read_only())?;
            self.store.save(&token)?;
            resolution = self.store.resolve(&token)?;
            if resolution.is_stale {
                return Err(CapabilityError::Stale(key.as_path().to_path_buf()));
            }
        }

        if !self.platform.begin_access(&resolution.handle) {
            return Err(CapabilityError::Denied(key.as_path().to_path_buf()));
        }

        self.sink.emit(
            LogLevel::Debug,
            "access granted",
            &[("path", key.to_string())],
        );
        Ok(ActiveGrant::new(
            key.clone(),
            token,
            resolution.handle,
            self.max_duration,
        ))
    }

    fn close_grant(&self, grant: &ActiveGrant) {
        self.platform.end_access(&grant.handle);
        self.sink.emit(
            LogLevel::Debug,
            "access ended",
            &[
                ("path", grant.key.to_string()),
                ("held_ms", grant.age().as_millis().to_string()),
            ],
        );
    }

    fn denied_or_raise(&self, key: &ResourceKey, err: CapabilityError) -> CapabilityResult<bool> {
        if err.is_denial() {
            self.sink.emit(
                LogLevel::Warn,
                "access denied",
                &[("path", key.to_string()), ("reason", err.to_string())],
            );
            Ok(false)
        } else {
            self.sink.emit(
                LogLevel::Error,
                "capability unusable",
                &[("path", key.to_string()), ("error", err.to_string())],
            );
            Err(err)
        }
    }
}

fn add_holder(grant: &mut ActiveGrant, holder: Holder) {
    match holder {
        Holder::Started => grant.started = true,
        Holder::Counted => grant.holders = grant.holders.saturating_add(1),
    }
}
