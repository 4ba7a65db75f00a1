/*!
 * Core Types
 * Common types used across the execution core
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Common result type for execution core operations
pub type ExecResult<T> = Result<T, super::errors::ExecError>;

/// Identifier of a single command submission, unique per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity token exchanged during the channel handshake
///
/// A nil session is the platform "default" value and is never trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random session
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The default (untrusted) session
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    #[inline]
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized resource path used as the key for tokens and grants
///
/// Lexically cleaned (`a/./b/../c` -> `a/c`) without touching the
/// filesystem, so keys stay stable even when the target is unmounted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(PathBuf);

impl ResourceKey {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        use path_clean::PathClean;
        Self(path.as_ref().to_path_buf().clean())
    }

    #[inline]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Key under which the capability store keeps this resource's token
    pub fn vault_key(&self) -> String {
        format!("capability:{}", self.0.display())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&Path> for ResourceKey {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}
