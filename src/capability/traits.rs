/*!
 * Capability Traits
 * Platform primitives behind capability tokens
 */

use super::types::{CapabilityResult, Resolution, ResourceHandle};
use std::path::Path;
use std::sync::Arc;

/// OS-level capability primitives
///
/// Implementations wrap whatever the platform offers (security-scoped
/// bookmarks, portal document handles, plain path checks) behind one
/// contract.
pub trait CapabilityPlatform: Send + Sync {
    /// Issue fresh token bytes for `path`
    fn issue_token(&self, path: &Path, read_only: bool) -> CapabilityResult<Vec<u8>>;

    /// Turn token bytes back into a handle
    ///
    /// Undecodable bytes are `Corrupt`; a target that no longer exists is
    /// `Denied`; a target that changed identity resolves with `is_stale`.
    fn resolve_token(&self, bytes: &[u8]) -> CapabilityResult<Resolution>;

    /// Start using the resource; `false` means the platform refused
    fn begin_access(&self, handle: &ResourceHandle) -> bool;

    /// Stop using the resource
    fn end_access(&self, handle: &ResourceHandle);
}

/// Shared platform handle
pub type SharedPlatform = Arc<dyn CapabilityPlatform>;
