/*!
 * Backup Facade
 *
 * Restic-style repository operations as thin wrappers over
 * `CommandExecutor::submit`. The repository password, when the vault holds
 * one, travels as `RESTIC_PASSWORD` and never on the command line.
 */

use super::cancel::CancelToken;
use super::command_executor::CommandExecutor;
use super::request::{CommandRequest, CommandResult};
use super::snapshot::{parse_snapshots, SnapshotDescriptor};
use crate::core::config::ExecConfig;
use crate::core::errors::ExecError;
use crate::core::limits::REPOSITORY_PASSWORD_PREFIX;
use crate::core::types::{ExecResult, ResourceKey};
use crate::vault::{SharedVault, VaultError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const PASSWORD_ENV: &str = "RESTIC_PASSWORD";

pub struct BackupClient {
    executor: Arc<CommandExecutor>,
    vault: SharedVault,
    tool: String,
    timeout: Duration,
    retry_budget: u32,
}

impl BackupClient {
    pub fn new(executor: Arc<CommandExecutor>, vault: SharedVault, config: &ExecConfig) -> Self {
        Self {
            executor,
            vault,
            tool: config.tool.clone(),
            timeout: config.command_timeout,
            retry_budget: config.retry_budget,
        }
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    /// Store the password used for `repository`
    pub fn set_repository_password(&self, repository: &Path, password: &str) -> ExecResult<()> {
        self.vault
            .put(&password_key(repository), password.as_bytes())
            .map_err(ExecError::from)
    }

    /// Create a new repository at `path`
    pub async fn initialize_repository(&self, path: &Path) -> ExecResult<CommandResult> {
        let request = self
            .request(path)?
            .args(["init", "--repo"])
            .arg(path_arg(path))
            .arg("--json")
            .with_resource(path);
        self.executor.submit(request).await
    }

    /// Back `source_paths` up into the repository at `destination`
    pub async fn backup(
        &self,
        source_paths: &[PathBuf],
        destination: &Path,
    ) -> ExecResult<CommandResult> {
        self.backup_with_cancel(source_paths, destination, &CancelToken::new())
            .await
    }

    pub async fn backup_with_cancel(
        &self,
        source_paths: &[PathBuf],
        destination: &Path,
        cancel: &CancelToken,
    ) -> ExecResult<CommandResult> {
        if source_paths.is_empty() {
            return Err(ExecError::InvalidRequest("backup needs at least one source".into()));
        }

        let request = self
            .request(destination)?
            .args(["backup", "--repo"])
            .arg(path_arg(destination))
            .arg("--json")
            .args(source_paths.iter().map(|p| path_arg(p)))
            .with_resources(source_paths.iter().cloned())
            .with_resource(destination);
        self.executor.submit_with_cancel(request, cancel).await
    }

    /// Restore `snapshot_id` from `repository` into `destination`
    pub async fn restore(
        &self,
        repository: &Path,
        snapshot_id: &str,
        destination: &Path,
    ) -> ExecResult<CommandResult> {
        validate_snapshot_id(snapshot_id)?;

        let request = self
            .request(repository)?
            .args(["restore", snapshot_id, "--repo"])
            .arg(path_arg(repository))
            .arg("--target")
            .arg(path_arg(destination))
            .arg("--json")
            .with_resource(repository)
            .with_resource(destination);
        self.executor.submit(request).await
    }

    /// Snapshots stored in `repository`, oldest first
    pub async fn list_snapshots(&self, repository: &Path) -> ExecResult<Vec<SnapshotDescriptor>> {
        let request = self
            .request(repository)?
            .args(["snapshots", "--repo"])
            .arg(path_arg(repository))
            .arg("--json")
            .with_resource(repository);
        let result = self.executor.submit(request).await?;
        parse_snapshots(result.stdout())
    }

    /// Health of the executor and everything it depends on
    pub async fn perform_health_check(&self) -> bool {
        self.executor.perform_health_check().await
    }

    /// Request skeleton carrying tool, limits and the repository password
    fn request(&self, repository: &Path) -> ExecResult<CommandRequest> {
        let mut request = CommandRequest::new(self.tool.clone())
            .with_timeout(self.timeout)
            .with_retry_budget(self.retry_budget);

        match self.vault.get(&password_key(repository)) {
            Ok(secret) => {
                let password = String::from_utf8(secret).map_err(|_| {
                    ExecError::Vault("repository password is not valid UTF-8".into())
                })?;
                request = request.with_env(PASSWORD_ENV, password);
            }
            Err(VaultError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        Ok(request)
    }
}

fn password_key(repository: &Path) -> String {
    format!(
        "{REPOSITORY_PASSWORD_PREFIX}{}",
        ResourceKey::new(repository)
    )
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Snapshot ids are hex ids, short ids, or `latest`
fn validate_snapshot_id(snapshot_id: &str) -> ExecResult<()> {
    if snapshot_id.is_empty() || !snapshot_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ExecError::InvalidRequest(format!(
            "invalid snapshot id {snapshot_id:?}"
        )));
    }
    Ok(())
}
