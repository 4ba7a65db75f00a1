/*!
 * In-memory Vault
 */

use super::{SecretVault, VaultError, VaultResult};
use ahash::RandomState;
use dashmap::DashMap;

/// Process-local vault; contents vanish with the process
#[derive(Debug, Default)]
pub struct MemoryVault {
    secrets: DashMap<String, Vec<u8>, RandomState>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl SecretVault for MemoryVault {
    fn put(&self, key: &str, secret: &[u8]) -> VaultResult<()> {
        self.secrets.insert(key.to_string(), secret.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> VaultResult<Vec<u8>> {
        self.secrets
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> VaultResult<()> {
        self.secrets.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> VaultResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .secrets
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
