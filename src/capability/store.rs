/*!
 * Capability Store
 *
 * Keeps the resource path -> capability token association. Secret bytes
 * live in the injected vault; the platform turns tokens back into handles.
 */

use super::traits::SharedPlatform;
use super::types::{CapabilityError, CapabilityResult, CapabilityToken, Resolution};
use crate::core::types::ResourceKey;
use crate::monitoring::{LogLevel, SharedSink};
use crate::vault::{SharedVault, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const KEY_PREFIX: &str = "capability:";

/// What the vault holds for one resource
#[derive(Serialize, Deserialize)]
struct StoredToken {
    path: PathBuf,
    bytes: Vec<u8>,
    read_only: bool,
}

pub struct CapabilityStore {
    vault: SharedVault,
    platform: SharedPlatform,
    sink: SharedSink,
}

impl CapabilityStore {
    pub fn new(vault: SharedVault, platform: SharedPlatform, sink: SharedSink) -> Self {
        Self {
            vault,
            platform,
            sink,
        }
    }

    /// Persist `token` under its path, replacing any previous token
    pub fn save(&self, token: &CapabilityToken) -> CapabilityResult<()> {
        let record = StoredToken {
            path: token.path().to_path_buf(),
            bytes: token.bytes().to_vec(),
            read_only: token.read_only(),
        };
        let encoded = bincode::serialize(&record)
            .map_err(|e| CapabilityError::Platform(e.to_string()))?;
        self.vault.put(&token.key().vault_key(), &encoded)?;
        Ok(())
    }

    /// Load the token for `key`, `NotFound` if none was ever granted
    pub fn load(&self, key: &ResourceKey) -> CapabilityResult<CapabilityToken> {
        let encoded = match self.vault.get(&key.vault_key()) {
            Ok(encoded) => encoded,
            Err(VaultError::NotFound(_)) => {
                return Err(CapabilityError::NotFound(key.as_path().to_path_buf()))
            }
            Err(err) => return Err(err.into()),
        };

        let record: StoredToken =
            bincode::deserialize(&encoded).map_err(|e| CapabilityError::Corrupt {
                path: key.as_path().to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(CapabilityToken::new(
            ResourceKey::new(&record.path),
            record.bytes,
            record.read_only,
        ))
    }

    /// Forget the token for `key`; absent keys are fine
    pub fn delete(&self, key: &ResourceKey) -> CapabilityResult<()> {
        self.vault.delete(&key.vault_key())?;
        Ok(())
    }

    /// Resolve a token into a live handle
    pub fn resolve(&self, token: &CapabilityToken) -> CapabilityResult<Resolution> {
        self.platform
            .resolve_token(token.bytes())
            .map_err(|err| match err {
                CapabilityError::Corrupt { reason, .. } => CapabilityError::Corrupt {
                    path: token.path().to_path_buf(),
                    reason,
                },
                CapabilityError::Denied(_) => CapabilityError::Denied(token.path().to_path_buf()),
                other => other,
            })
            .map(|mut resolution| {
                // Handles are addressed by the key the caller used
                resolution.handle.key = token.key().clone();
                resolution
            })
    }

    /// Ask the platform for a new token without persisting it
    pub fn issue(&self, key: &ResourceKey, read_only: bool) -> CapabilityResult<CapabilityToken> {
        let bytes = self.platform.issue_token(key.as_path(), read_only)?;
        Ok(CapabilityToken::new(key.clone(), bytes, read_only))
    }

    /// Record a user grant for `path` (e.g. after a folder picker)
    pub fn register(&self, path: impl AsRef<Path>, read_only: bool) -> CapabilityResult<CapabilityToken> {
        let key = ResourceKey::new(path);
        let token = self.issue(&key, read_only)?;
        self.save(&token)?;
        self.sink.emit(
            LogLevel::Info,
            "capability registered",
            &[("path", key.to_string()), ("read_only", read_only.to_string())],
        );
        Ok(token)
    }

    /// Paths with a stored token
    pub fn keys(&self) -> CapabilityResult<Vec<ResourceKey>> {
        Ok(self
            .vault
            .keys(KEY_PREFIX)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(ResourceKey::new))
            .collect())
    }

    /// Remove every stored token
    pub fn clear(&self) -> CapabilityResult<()> {
        for key in self.vault.keys(KEY_PREFIX)? {
            self.vault.delete(&key)?;
        }
        self.sink.emit(LogLevel::Info, "capability store cleared", &[]);
        Ok(())
    }
}
