/*!
 * Active Grants
 */

use crate::capability::{CapabilityToken, ResourceHandle};
use crate::core::types::ResourceKey;
use std::time::{Duration, Instant};

/// Open lease on one resource between start and stop access
#[derive(Debug, Clone)]
pub struct ActiveGrant {
    pub(crate) key: ResourceKey,
    pub(crate) started_at: Instant,
    pub(crate) max_duration: Duration,
    pub(crate) token: CapabilityToken,
    pub(crate) handle: ResourceHandle,
    /// Counted holders from `retain`
    pub(crate) holders: u32,
    /// Held by a plain `start_accessing` until the matching stop
    pub(crate) started: bool,
}

impl ActiveGrant {
    pub(crate) fn new(
        key: ResourceKey,
        token: CapabilityToken,
        handle: ResourceHandle,
        max_duration: Duration,
    ) -> Self {
        Self {
            key,
            started_at: Instant::now(),
            max_duration,
            token,
            handle,
            holders: 0,
            started: false,
        }
    }

    /// No holder of either kind is left; access may end
    #[inline]
    pub(crate) fn is_idle(&self) -> bool {
        self.holders == 0 && !self.started
    }

    #[inline]
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Outlived its lease: access was begun and never ended
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.age() > self.max_duration
    }

    pub fn info(&self) -> GrantInfo {
        GrantInfo {
            key: self.key.clone(),
            age: self.age(),
            max_duration: self.max_duration,
            holders: self.holders,
            started: self.started,
            read_only: self.token.read_only(),
        }
    }
}

/// Point-in-time view of a grant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantInfo {
    pub key: ResourceKey,
    pub age: Duration,
    pub max_duration: Duration,
    pub holders: u32,
    pub started: bool,
    pub read_only: bool,
}
