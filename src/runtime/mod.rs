//! Execution service: the container runtime that hosts session containers.
//!
//! The broker only talks to containers by name through [`ContainerRuntime`]; it never holds
//! a process handle across invocations.

mod docker;

pub use docker::{DockerRuntime, BROKER_LABEL, PROJECT_LABEL};

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::ContainerConfig;

/// Observed state of a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    /// Exists but is not running (exited, created, paused).
    Stopped,
    Absent,
}

/// Everything needed to launch a long-lived session container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory mounted read-write at `workdir`.
    pub host_path: PathBuf,
    pub workdir: String,
    pub user: Option<String>,
    pub network: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit: Option<f64>,
}

impl ContainerSpec {
    pub fn from_config(name: &str, host_path: PathBuf, config: &ContainerConfig) -> Self {
        Self {
            name: name.to_string(),
            image: config.image.trim().to_string(),
            host_path,
            workdir: config.workdir.clone(),
            user: config.run_as().map(str::to_string),
            network: config
                .network
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            memory_limit_mb: config.memory_limit_mb.filter(|mb| *mb > 0),
            cpu_limit: config.cpu_limit.filter(|cpus| *cpus > 0.0),
        }
    }
}

/// Captured result of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

/// Container runtime operations used by the broker.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable runtime name.
    fn name(&self) -> &str;

    /// State of the container with exactly this name.
    async fn state(&self, name: &str) -> anyhow::Result<ContainerState>;

    /// Launch a detached container running an indefinite no-op.
    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<()>;

    /// Host project directory the container was created with, if it was recorded.
    async fn mounted_project(&self, name: &str) -> anyhow::Result<Option<PathBuf>>;

    /// Start an existing stopped container.
    async fn start(&self, name: &str) -> anyhow::Result<()>;

    /// Startup and runtime log of the container.
    async fn logs(&self, name: &str) -> anyhow::Result<String>;

    /// Run `argv` inside the container with `workdir` as working directory.
    async fn exec(&self, name: &str, workdir: &str, argv: &[String]) -> anyhow::Result<ExecOutput>;

    /// Force-remove the container. Removing an absent container succeeds.
    async fn remove(&self, name: &str) -> anyhow::Result<()>;
}
