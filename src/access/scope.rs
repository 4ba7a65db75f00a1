/*!
 * Access Scope
 *
 * RAII holder of counted grants. Every grant the scope took is released
 * when it drops, whether the protected operation returned, failed, was
 * cancelled, or panicked.
 *
 * ```ignore
 * let scope = AccessScope::acquire(&broker, &request.resource_paths)?;
 * let result = proxy.execute(&request).await;
 * drop(scope); // grants released
 * ```
 */

use super::broker::AccessBroker;
use crate::capability::CapabilityToken;
use crate::core::errors::ExecError;
use crate::core::types::{ExecResult, ResourceKey};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[must_use = "grants are released as soon as the scope is dropped"]
pub struct AccessScope {
    broker: Arc<AccessBroker>,
    /// Held keys with the broker epoch each holder belongs to
    held: Vec<(ResourceKey, u64)>,
}

impl AccessScope {
    /// Retain a grant for every path, or none at all
    ///
    /// On the first denial the grants already taken are released and
    /// `AccessDenied(path)` is returned.
    pub fn acquire<P: AsRef<Path>>(broker: &Arc<AccessBroker>, paths: &[P]) -> ExecResult<Self> {
        let mut scope = Self {
            broker: Arc::clone(broker),
            held: Vec::with_capacity(paths.len()),
        };

        for path in paths {
            let key = ResourceKey::new(path);
            if scope.held.iter().any(|(held, _)| *held == key) {
                continue;
            }
            let epoch = scope.retain(&key)?;
            scope.held.push((key, epoch));
        }

        Ok(scope)
    }

    /// Re-take grants voided by a broker-wide release
    ///
    /// Called before each retry so a reconnect never runs a command
    /// against resources whose access already ended.
    pub fn refresh(&mut self) -> ExecResult<usize> {
        let current = self.broker.epoch();
        let mut renewed = 0;

        for index in 0..self.held.len() {
            if self.held[index].1 == current {
                continue;
            }
            let key = self.held[index].0.clone();
            let epoch = self.retain(&key)?;
            self.held[index].1 = epoch;
            renewed += 1;
        }

        Ok(renewed)
    }

    fn retain(&self, key: &ResourceKey) -> ExecResult<u64> {
        match self.broker.retain_in_epoch(key.as_path()) {
            Ok(Some(epoch)) => Ok(epoch),
            Ok(None) => Err(ExecError::AccessDenied(PathBuf::from(key.as_path()))),
            Err(err) => Err(err.into()),
        }
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.held.iter().map(|(key, _)| key.as_path()).collect()
    }

    /// Tokens backing the held grants, in acquisition order
    pub fn tokens(&self) -> Vec<CapabilityToken> {
        self.held
            .iter()
            .filter_map(|(key, _)| self.broker.token(key.as_path()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release now instead of at end of scope
    pub fn release(mut self) {
        self.release_held();
    }

    fn release_held(&mut self) {
        for (key, epoch) in self.held.drain(..).rev() {
            self.broker.release_in_epoch(key.as_path(), epoch);
        }
    }
}

impl Drop for AccessScope {
    fn drop(&mut self) {
        self.release_held();
    }
}

impl std::fmt::Debug for AccessScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessScope").field("held", &self.held).finish()
    }
}
