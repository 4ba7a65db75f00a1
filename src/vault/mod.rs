/*!
 * Secret Vault
 *
 * Opaque key -> secret bytes storage consumed by the capability store and
 * by callers keeping repository passwords. Real deployments plug in the
 * platform credential store; the in-memory and file vaults here cover the
 * helper binary and tests.
 */

mod file;
mod memory;

pub use file::FileVault;
pub use memory::MemoryVault;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Vault operation result
///
/// # Must Use
/// A failed vault write means a capability was not persisted
#[must_use = "vault operations can fail and must be handled"]
pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultError {
    #[error("No secret stored under {0:?}")]
    NotFound(String),

    #[error("Vault storage failure: {0}")]
    Storage(String),

    #[error("Vault contents unreadable: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

/// Key/value secret store
pub trait SecretVault: Send + Sync {
    /// Store `secret` under `key`, replacing any previous value
    fn put(&self, key: &str, secret: &[u8]) -> VaultResult<()>;

    /// Fetch the secret under `key`, `NotFound` if absent
    fn get(&self, key: &str) -> VaultResult<Vec<u8>>;

    /// Remove `key`; absent keys are not an error
    fn delete(&self, key: &str) -> VaultResult<()>;

    /// Keys starting with `prefix`
    fn keys(&self, prefix: &str) -> VaultResult<Vec<String>>;
}

/// Shared vault handle
pub type SharedVault = Arc<dyn SecretVault>;

/// File vault at `path` when one is configured, process-local otherwise
pub fn open_vault(path: Option<&Path>) -> VaultResult<SharedVault> {
    match path {
        Some(path) => Ok(Arc::new(FileVault::open(path)?)),
        None => Ok(Arc::new(MemoryVault::new())),
    }
}
