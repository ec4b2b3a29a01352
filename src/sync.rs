//! Remote file sync: push editor content into a student's sandbox.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::FileSyncConfig;
use crate::error::{RemoteError, SyncError};
use crate::identity::{self, shell_quote};
use crate::remote::RemoteAccess;
use crate::runtime::{ContainerRuntime, ExecRequest};
use crate::store::{SessionRecord, SessionStore};

pub struct FileSync {
    store: SessionStore,
    remote: Arc<dyn RemoteAccess>,
    runtime: Arc<dyn ContainerRuntime>,
    home_dir: String,
    sandbox_user: String,
    retry_attempts: u32,
    retry_delay: Duration,
    listed_extensions: Vec<String>,
}

impl FileSync {
    pub fn new(
        store: SessionStore,
        remote: Arc<dyn RemoteAccess>,
        runtime: Arc<dyn ContainerRuntime>,
        home_dir: String,
        sandbox_user: String,
        config: &FileSyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            runtime,
            home_dir,
            sandbox_user,
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
            listed_extensions: config.listed_extensions.clone(),
        }
    }

    /// In-sandbox absolute path for a user-supplied path.
    pub fn resolve(&self, path: &str) -> String {
        identity::normalize_path(&self.home_dir, path)
    }

    pub fn home_dir(&self) -> &str {
        &self.home_dir
    }

    async fn session(&self, user_id: &str) -> Result<SessionRecord, SyncError> {
        self.store
            .latest_for_user(user_id)
            .await?
            .ok_or_else(|| SyncError::NoSession(user_id.to_string()))
    }

    /// Write `content` to `path` in the user's most recent sandbox.
    ///
    /// Returns the absolute in-sandbox path written. Refused connections are
    /// retried while the sandbox's shell service boots; any other failure is final.
    pub async fn push(&self, user_id: &str, path: &str, content: &[u8]) -> Result<String, SyncError> {
        let session = self.session(user_id).await?;
        let target = self.resolve(path);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.remote.write_file(session.port, &target, content).await {
                Ok(()) => {
                    debug!(user_id, path = %target, bytes = content.len(), "Pushed file");
                    return Ok(target);
                }
                Err(RemoteError::ConnectionRefused(port)) if attempt < self.retry_attempts => {
                    warn!(user_id, port, attempt, "Shell service not ready, retrying push");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(source) => {
                    return Err(SyncError::Remote {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Move a file inside the user's sandbox, creating the destination directory.
    pub async fn rename(&self, user_id: &str, old_path: &str, new_path: &str) -> Result<(), SyncError> {
        let session = self.session(user_id).await?;
        let from = self.resolve(old_path);
        let to = self.resolve(new_path);

        let script = format!(
            "mkdir -p {} && mv {} {}",
            shell_quote(&identity::dirname(&to)),
            shell_quote(&from),
            shell_quote(&to)
        );
        let output = self
            .runtime
            .exec(
                &session.sandbox_name,
                ExecRequest::shell(script).user(self.sandbox_user.as_str()),
            )
            .await?;

        if output.exit_code != 0 {
            return Err(SyncError::Command {
                action: "rename",
                stderr: output.stderr.trim().to_string(),
            });
        }
        info!(user_id, from = %from, to = %to, "Renamed file");
        Ok(())
    }

    /// Editable files directly inside `dir` (the home directory when `None`), by name.
    pub async fn list(&self, user_id: &str, dir: Option<&str>) -> Result<Vec<String>, SyncError> {
        let dir = self.resolve(dir.unwrap_or(&self.home_dir));
        let stdout = self.run(user_id, "list", ["ls", "-1", "--", dir.as_str()]).await?;

        Ok(stdout
            .lines()
            .filter(|name| {
                self.listed_extensions
                    .iter()
                    .any(|extension| name.ends_with(extension.as_str()))
            })
            .map(str::to_string)
            .collect())
    }

    /// Text content of `path` in the user's most recent sandbox.
    pub async fn read(&self, user_id: &str, path: &str) -> Result<String, SyncError> {
        let path = self.resolve(path);
        let code = self.run(user_id, "read", ["cat", "--", path.as_str()]).await?;
        debug!(user_id, path = %path, bytes = code.len(), "Read file");
        Ok(code)
    }

    async fn run<const N: usize>(
        &self,
        user_id: &str,
        action: &'static str,
        cmd: [&str; N],
    ) -> Result<String, SyncError> {
        let session = self.session(user_id).await?;
        let output = self
            .runtime
            .exec(
                &session.sandbox_name,
                ExecRequest::new(cmd).user(self.sandbox_user.as_str()),
            )
            .await?;

        if output.exit_code != 0 {
            return Err(SyncError::Command {
                action,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}
