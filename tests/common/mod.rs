//! Shared fixtures: an in-memory container runtime and broker builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sandbox_broker::{
    Broker, BrokerConfig, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput,
    RecordingIntrospector,
};

/// In-memory stand-in for the container runtime.
///
/// `echo <text>` prints `<text>`, `fail` exits 2 with a stderr line, anything else prints
/// `ran: <command>`.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerState>>,
    mounts: Mutex<HashMap<String, PathBuf>>,
    created: Mutex<Vec<ContainerSpec>>,
    started: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    execs: Mutex<Vec<(String, String, Vec<String>)>>,
    /// Containers "exit immediately" after create/start.
    crash_on_start: bool,
    logs: String,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn crashing(logs: &str) -> Self {
        Self {
            crash_on_start: true,
            logs: logs.to_string(),
            ..Self::default()
        }
    }

    pub fn with_container(self, name: &str, state: ContainerState) -> Self {
        self.containers.lock().insert(name.to_string(), state);
        self
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    /// (container, workdir, argv) of every exec call.
    pub fn execs(&self) -> Vec<(String, String, Vec<String>)> {
        self.execs.lock().clone()
    }

    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .iter()
            .filter(|(_, s)| **s == ContainerState::Running)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    fn launched_state(&self) -> ContainerState {
        if self.crash_on_start {
            ContainerState::Stopped
        } else {
            ContainerState::Running
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn state(&self, name: &str) -> anyhow::Result<ContainerState> {
        Ok(self
            .containers
            .lock()
            .get(name)
            .copied()
            .unwrap_or(ContainerState::Absent))
    }

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<()> {
        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            anyhow::bail!("Conflict. The container name \"/{}\" is already in use", spec.name);
        }
        containers.insert(spec.name.clone(), self.launched_state());
        self.mounts
            .lock()
            .insert(spec.name.clone(), spec.host_path.clone());
        self.created.lock().push(spec.clone());
        Ok(())
    }

    async fn mounted_project(&self, name: &str) -> anyhow::Result<Option<PathBuf>> {
        Ok(self.mounts.lock().get(name).cloned())
    }

    async fn start(&self, name: &str) -> anyhow::Result<()> {
        let state = self.launched_state();
        match self.containers.lock().get_mut(name) {
            Some(s) => *s = state,
            None => anyhow::bail!("No such container: {name}"),
        }
        self.started.lock().push(name.to_string());
        Ok(())
    }

    async fn logs(&self, _name: &str) -> anyhow::Result<String> {
        Ok(self.logs.clone())
    }

    async fn exec(&self, name: &str, workdir: &str, argv: &[String]) -> anyhow::Result<ExecOutput> {
        if self.containers.lock().get(name) != Some(&ContainerState::Running) {
            anyhow::bail!("container {name} is not running");
        }
        self.execs
            .lock()
            .push((name.to_string(), workdir.to_string(), argv.to_vec()));
        let command = argv.last().cloned().unwrap_or_default();
        let output = if let Some(text) = command.strip_prefix("echo ") {
            ExecOutput {
                stdout: format!("{text}\n"),
                stderr: String::new(),
                exit_code: Some(0),
            }
        } else if command == "fail" {
            ExecOutput {
                stdout: String::new(),
                stderr: "boom\n".into(),
                exit_code: Some(2),
            }
        } else {
            ExecOutput {
                stdout: format!("ran: {command}\n"),
                stderr: String::new(),
                exit_code: Some(0),
            }
        };
        Ok(output)
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.containers.lock().remove(name);
        self.mounts.lock().remove(name);
        self.removed.lock().push(name.to_string());
        Ok(())
    }
}

/// Config with state under `state_dir` and near-instant readiness polling.
pub fn test_config(state_dir: &Path) -> BrokerConfig {
    let mut config = BrokerConfig {
        state_dir: state_dir.to_path_buf(),
        ..BrokerConfig::default()
    };
    config.container.ready_initial_delay_ms = 1;
    config.container.ready_attempts = 3;
    config
}

pub struct Harness {
    pub broker: Broker,
    pub runtime: Arc<FakeRuntime>,
    pub notes: Arc<RecordingIntrospector>,
}

pub fn harness(config: BrokerConfig, runtime: FakeRuntime) -> Harness {
    let runtime = Arc::new(runtime);
    let notes = Arc::new(RecordingIntrospector::new());
    let broker = Broker::new(config, runtime.clone(), notes.clone());
    Harness {
        broker,
        runtime,
        notes,
    }
}

/// The code delivered in the most recent `**NNNNNN**` side-channel note.
pub fn last_code(notes: &RecordingIntrospector) -> Option<String> {
    notes.notes().iter().rev().find_map(|note| {
        let start = note.find("**")? + 2;
        let len = note.get(start..)?.find("**")?;
        note.get(start..start + len).map(str::to_string)
    })
}
