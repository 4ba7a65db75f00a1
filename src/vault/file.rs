/*!
 * File-backed Vault
 *
 * Whole-map persistence with bincode. Writes go to a sibling temporary
 * file that is renamed over the target, so a crash never leaves a torn
 * vault behind. The in-memory map only changes once the write succeeded.
 */

use super::{SecretVault, VaultError, VaultResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct FileVault {
    path: PathBuf,
    secrets: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileVault {
    /// Open (or lazily create) the vault at `path`
    pub fn open(path: impl Into<PathBuf>) -> VaultResult<Self> {
        let path = path.into();
        let secrets = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                bincode::deserialize(&bytes).map_err(|e| VaultError::Corrupt(e.to_string()))?
            }
        } else {
            BTreeMap::new()
        };

        debug!(path = %path.display(), entries = secrets.len(), "File vault opened");
        Ok(Self {
            path,
            secrets: Mutex::new(secrets),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, secrets: &BTreeMap<String, Vec<u8>>) -> VaultResult<()> {
        let bytes = bincode::serialize(secrets).map_err(|e| VaultError::Storage(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = open_private(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Vault rename failed");
            VaultError::from(e)
        })
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}

impl SecretVault for FileVault {
    fn put(&self, key: &str, secret: &[u8]) -> VaultResult<()> {
        let mut secrets = self.secrets.lock();
        let mut next = secrets.clone();
        next.insert(key.to_string(), secret.to_vec());
        self.persist(&next)?;
        *secrets = next;
        Ok(())
    }

    fn get(&self, key: &str) -> VaultResult<Vec<u8>> {
        self.secrets
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> VaultResult<()> {
        let mut secrets = self.secrets.lock();
        if !secrets.contains_key(key) {
            return Ok(());
        }
        let mut next = secrets.clone();
        next.remove(key);
        self.persist(&next)?;
        *secrets = next;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> VaultResult<Vec<String>> {
        Ok(self
            .secrets
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
