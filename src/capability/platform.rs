/*!
 * Path Capability Platform
 *
 * Capability primitives for Unix hosts without a bookmark service. A token
 * pins the canonical path together with the device and inode it pointed at
 * when issued:
 *
 * - unreadable bytes            -> `Corrupt`
 * - target vanished             -> `Denied`
 * - device or inode changed     -> stale (re-mount, replaced directory)
 *
 * Access checks use the effective uid through `access(2)`.
 */

use super::traits::CapabilityPlatform;
use super::types::{CapabilityError, CapabilityResult, Resolution, ResourceHandle};
use crate::core::types::ResourceKey;
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;
use tracing::{debug, warn};

const TOKEN_MAGIC: &[u8; 4] = b"SXC1";

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PathTokenPayload {
    path: PathBuf,
    read_only: bool,
    device: u64,
    inode: u64,
    #[serde_as(as = "TimestampSeconds<i64>")]
    issued_at: SystemTime,
}

/// Path-pinning capability platform
#[derive(Debug, Default)]
pub struct PathCapabilityPlatform {
    active: AtomicUsize,
    issued: AtomicU64,
}

impl PathCapabilityPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accesses begun and not yet ended
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Tokens issued by this instance
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    fn decode(bytes: &[u8]) -> CapabilityResult<PathTokenPayload> {
        let corrupt = |reason: String| CapabilityError::Corrupt {
            path: PathBuf::new(),
            reason,
        };

        let body = bytes
            .strip_prefix(TOKEN_MAGIC.as_slice())
            .ok_or_else(|| corrupt("missing token header".into()))?;
        bincode::deserialize(body).map_err(|e| corrupt(e.to_string()))
    }
}

impl CapabilityPlatform for PathCapabilityPlatform {
    fn issue_token(&self, path: &Path, read_only: bool) -> CapabilityResult<Vec<u8>> {
        let canonical = path
            .canonicalize()
            .map_err(|_| CapabilityError::Denied(path.to_path_buf()))?;
        let meta = std::fs::metadata(&canonical)
            .map_err(|_| CapabilityError::Denied(path.to_path_buf()))?;

        let payload = PathTokenPayload {
            path: canonical,
            read_only,
            device: meta.dev(),
            inode: meta.ino(),
            issued_at: SystemTime::now(),
        };

        let mut bytes = TOKEN_MAGIC.to_vec();
        bincode::serialize_into(&mut bytes, &payload)
            .map_err(|e| CapabilityError::Platform(e.to_string()))?;

        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), read_only, "Issued path capability");
        Ok(bytes)
    }

    fn resolve_token(&self, bytes: &[u8]) -> CapabilityResult<Resolution> {
        let payload = Self::decode(bytes)?;

        let meta = std::fs::metadata(&payload.path)
            .map_err(|_| CapabilityError::Denied(payload.path.clone()))?;
        let is_stale = meta.dev() != payload.device || meta.ino() != payload.inode;
        if is_stale {
            debug!(path = %payload.path.display(), "Path capability is stale");
        }

        Ok(Resolution {
            handle: ResourceHandle {
                key: ResourceKey::new(&payload.path),
                target: payload.path,
                read_only: payload.read_only,
            },
            is_stale,
        })
    }

    fn begin_access(&self, handle: &ResourceHandle) -> bool {
        let mut mode = AccessFlags::R_OK;
        if !handle.read_only {
            mode |= AccessFlags::W_OK;
        }

        match access(&handle.target, mode) {
            Ok(()) => {
                self.active.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(errno) => {
                warn!(path = %handle.target.display(), %errno, "Platform refused access");
                false
            }
        }
    }

    fn end_access(&self, handle: &ResourceHandle) {
        let prev = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev.is_err() {
            warn!(path = %handle.target.display(), "end_access without matching begin_access");
        }
    }
}
