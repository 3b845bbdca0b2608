//! Per-session container lifecycle: lookup, idempotent creation, readiness, teardown.
//!
//! Containers are named `prefix + session id` and are only ever referenced by that name.
//! Creation is serialized per container through a lock file, so invocations racing on the
//! same session create at most one container.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;

use crate::config::{BrokerConfig, ContainerConfig};
use crate::error::{BrokerError, StoreError};
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState};
use crate::session::SessionId;

/// A running session container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContainer {
    pub name: String,
    /// The container was created or restarted by this call.
    pub started: bool,
}

/// Validate and canonicalize the host project directory that gets mounted.
pub fn resolve_project_path(raw: Option<&str>) -> Result<PathBuf, BrokerError> {
    let raw = raw.map(str::trim).filter(|p| !p.is_empty()).ok_or_else(|| {
        BrokerError::Configuration("parameter 'project_path' is missing or invalid".into())
    })?;
    let resolved = Path::new(raw)
        .canonicalize()
        .map_err(|_| BrokerError::Configuration(format!("project directory not found: {raw}")))?;
    if !resolved.is_dir() {
        return Err(BrokerError::Configuration(format!(
            "project path is not a directory: {}",
            resolved.display()
        )));
    }
    if resolved == Path::new("/") {
        return Err(BrokerError::Configuration(
            "refusing to mount filesystem root (/) into a session container".into(),
        ));
    }
    Ok(resolved)
}

/// Creates, verifies and removes session containers.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    locks_dir: PathBuf,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &BrokerConfig) -> Self {
        Self {
            runtime,
            config: config.container.clone(),
            locks_dir: config.locks_dir(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn container_name(&self, session: &SessionId) -> String {
        format!("{}{}", self.config.name_prefix, session)
    }

    /// Take the per-container creation lock.
    ///
    /// `flock` blocks, so it is acquired on the blocking pool; a second caller in the same
    /// process waits there instead of stalling the runtime thread the holder needs.
    async fn lock(&self, name: &str) -> Result<File, BrokerError> {
        let dir = self.locks_dir.clone();
        let path = dir.join(format!("{name}.lock"));
        tokio::task::spawn_blocking(move || -> Result<File, BrokerError> {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StoreError::io(&path, e))?;
            file.lock_exclusive()
                .map_err(|source| StoreError::Lock { path, source })?;
            Ok(file)
        })
        .await
        .map_err(|e| BrokerError::Runtime(format!("container lock task failed: {e}")))?
    }

    /// Refuse to reuse a container that mounts a different project directory.
    async fn check_mount(&self, name: &str, project: &Path) -> Result<(), BrokerError> {
        let mounted = self
            .runtime
            .mounted_project(name)
            .await
            .map_err(|e| BrokerError::Runtime(format!("{e:#}")))?;
        match mounted {
            Some(mounted) if mounted != project => Err(BrokerError::Configuration(format!(
                "container {name} mounts {}, not {}; destroy it before switching projects",
                mounted.display(),
                project.display()
            ))),
            _ => Ok(()),
        }
    }

    async fn state(&self, name: &str) -> Result<ContainerState, BrokerError> {
        self.runtime
            .state(name)
            .await
            .map_err(|e| BrokerError::Runtime(format!("{e:#}")))
    }

    async fn startup_failure(&self, name: &str, message: String) -> BrokerError {
        let logs = match self.runtime.logs(name).await {
            Ok(logs) if !logs.trim().is_empty() => logs,
            Ok(_) => "(no output)".to_string(),
            Err(e) => format!("(log unavailable: {e:#})"),
        };
        BrokerError::Infrastructure {
            container: name.to_string(),
            message,
            logs,
        }
    }

    /// Poll until the container runs, backing off exponentially between checks.
    async fn wait_until_running(&self, name: &str) -> Result<bool, BrokerError> {
        let mut delay = Duration::from_millis(self.config.ready_initial_delay_ms.max(1));
        for attempt in 1..=self.config.ready_attempts.max(1) {
            tokio::time::sleep(delay).await;
            if self.state(name).await? == ContainerState::Running {
                tracing::debug!(container = %name, attempt, "container is running");
                return Ok(true);
            }
            delay = delay.saturating_mul(2);
        }
        Ok(false)
    }

    /// Make sure the session container exists and runs, creating it on first use.
    pub async fn ensure_running(
        &self,
        session: &SessionId,
        project: &Path,
    ) -> Result<SessionContainer, BrokerError> {
        let name = self.container_name(session);
        let lock = self.lock(&name).await?;

        let launched = match self.state(&name).await? {
            ContainerState::Running => {
                self.check_mount(&name, project).await?;
                drop(lock);
                return Ok(SessionContainer {
                    name,
                    started: false,
                });
            }
            ContainerState::Stopped => {
                self.check_mount(&name, project).await?;
                tracing::info!(container = %name, "restarting stopped session container");
                self.runtime.start(&name).await
            }
            ContainerState::Absent => {
                let spec = ContainerSpec::from_config(&name, project.to_path_buf(), &self.config);
                tracing::info!(
                    container = %name,
                    image = %spec.image,
                    user = spec.user.as_deref().unwrap_or("root"),
                    "creating session container"
                );
                self.runtime.create(&spec).await
            }
        };
        if let Err(e) = launched {
            return Err(self.startup_failure(&name, format!("{e:#}")).await);
        }

        if !self.wait_until_running(&name).await? {
            let attempts = self.config.ready_attempts.max(1);
            return Err(self
                .startup_failure(&name, format!("not running after {attempts} readiness checks"))
                .await);
        }
        drop(lock);
        Ok(SessionContainer {
            name,
            started: true,
        })
    }

    /// Remove the session container. Returns its name; absent containers are not an error.
    pub async fn destroy(&self, session: &SessionId) -> Result<String, BrokerError> {
        let name = self.container_name(session);
        let lock = self.lock(&name).await?;
        self.runtime
            .remove(&name)
            .await
            .map_err(|e| BrokerError::Runtime(format!("{e:#}")))?;
        drop(lock);
        tracing::info!(container = %name, "session container removed");
        Ok(name)
    }
}
