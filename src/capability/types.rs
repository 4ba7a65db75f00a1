/*!
 * Capability Types
 * Tokens, resource handles and capability errors
 */

use crate::core::types::ResourceKey;
use crate::vault::VaultError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Capability operation result
///
/// # Must Use
/// Capability operations can fail and must be handled to prevent leaks
#[must_use = "capability operations can fail and must be handled"]
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Capability errors
///
/// `Stale` is internal: the access broker always renews stale tokens
/// before anything leaves it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityError {
    #[error("No capability stored for {}", .0.display())]
    NotFound(PathBuf),

    #[error("Access to {} denied", .0.display())]
    Denied(PathBuf),

    #[error("Capability for {} is stale", .0.display())]
    Stale(PathBuf),

    #[error("Capability for {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Platform error: {0}")]
    Platform(String),
}

impl CapabilityError {
    /// Ordinary denial outcomes, as opposed to broken capability data
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Denied(_) | Self::Stale(_))
    }
}

/// Opaque, persistable grant for one filesystem resource
///
/// Tokens are replaced, never mutated, when they go stale.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    key: ResourceKey,
    bytes: Vec<u8>,
    read_only: bool,
}

impl CapabilityToken {
    pub fn new(key: ResourceKey, bytes: Vec<u8>, read_only: bool) -> Self {
        Self {
            key,
            bytes,
            read_only,
        }
    }

    #[inline]
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.key.as_path()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn read_only(&self) -> bool {
        self.read_only
    }
}

// Token bytes are secret-bearing; keep them out of logs
impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("key", &self.key)
            .field("len", &self.bytes.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Live handle to a resolved resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub key: ResourceKey,
    /// Filesystem location the token resolved to
    pub target: PathBuf,
    pub read_only: bool,
}

/// Outcome of resolving a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub handle: ResourceHandle,
    /// Resolvable but flagged expired by the platform; renew before use
    pub is_stale: bool,
}
