use std::path::PathBuf;
use std::process::Output;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{ContainerRuntime, ContainerSpec, ContainerState, ExecOutput};

/// Label applied to every container the broker creates (for filtering and cleanup).
pub const BROKER_LABEL: &str = "sandbox-broker=true";

/// Label key recording the host project directory mounted into the container.
pub const PROJECT_LABEL: &str = "sandbox-broker.project";

/// Entry process keeping a session container alive between commands.
const IDLE_ENTRYPOINT: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Docker CLI runtime. Every call is an argument vector; nothing goes through a host shell.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another Docker-compatible CLI (e.g. `podman`).
    pub fn with_binary(binary: impl Into<String>) -> Result<Self> {
        let binary = binary.into();
        if binary.trim().is_empty() {
            anyhow::bail!("container.runtime_binary cannot be empty");
        }
        Ok(Self {
            binary: binary.trim().to_string(),
        })
    }

    /// Exact-name filter; `name=foo` alone would also match `foobar`.
    pub fn name_filter(name: &str) -> String {
        format!("name=^/{name}$")
    }

    /// Arguments of the `run` call that launches a session container.
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--label".into(),
            BROKER_LABEL.into(),
            "--label".into(),
            format!("{PROJECT_LABEL}={}", spec.host_path.display()),
        ];
        if let Some(user) = &spec.user {
            args.extend(["--user".into(), user.clone()]);
        }
        if let Some(network) = &spec.network {
            args.extend(["--network".into(), network.clone()]);
        }
        if let Some(mb) = spec.memory_limit_mb {
            args.extend(["--memory".into(), format!("{mb}m")]);
        }
        if let Some(cpus) = spec.cpu_limit {
            args.extend(["--cpus".into(), cpus.to_string()]);
        }
        args.extend([
            "--volume".into(),
            format!("{}:{}:rw", spec.host_path.display(), spec.workdir),
            "--workdir".into(),
            spec.workdir.clone(),
            spec.image.clone(),
        ]);
        args.extend(IDLE_ENTRYPOINT.iter().map(|s| s.to_string()));
        args
    }

    /// Arguments of the `exec` call running `argv` in `name`.
    pub fn exec_args(name: &str, workdir: &str, argv: &[String]) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--workdir".to_string(),
            workdir.to_string(),
            name.to_string(),
        ];
        args.extend(argv.iter().cloned());
        args
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        tokio::process::Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {} {}", self.binary, first(args)))
    }

    async fn checked(&self, args: &[String]) -> Result<Output> {
        let out = self.output(args).await?;
        if !out.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                self.binary,
                first(args),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(out)
    }
}

fn first(args: &[String]) -> &str {
    args.first().map_or("", String::as_str)
}

fn parse_state(stdout: &str) -> ContainerState {
    match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
        None => ContainerState::Absent,
        Some(state) if state.eq_ignore_ascii_case("running") => ContainerState::Running,
        Some(_) => ContainerState::Stopped,
    }
}

/// `inspect` prints `<no value>` or nothing for a missing label.
fn parse_label(stdout: &str) -> Option<PathBuf> {
    let value = stdout.trim();
    (!value.is_empty() && value != "<no value>").then(|| PathBuf::from(value))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        let args = [
            "ps".to_string(),
            "-a".into(),
            "--filter".into(),
            Self::name_filter(name),
            "--format".into(),
            "{{.State}}".into(),
        ];
        let out = self.checked(&args).await?;
        Ok(parse_state(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        self.checked(&Self::create_args(spec)).await?;
        Ok(())
    }

    async fn mounted_project(&self, name: &str) -> Result<Option<PathBuf>> {
        let args = [
            "inspect".to_string(),
            "--format".into(),
            format!("{{{{index .Config.Labels \"{PROJECT_LABEL}\"}}}}"),
            name.to_string(),
        ];
        let out = self.checked(&args).await?;
        Ok(parse_label(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.checked(&["start".to_string(), name.to_string()]).await?;
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<String> {
        let out = self.output(&["logs".to_string(), name.to_string()]).await?;
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(text)
    }

    async fn exec(&self, name: &str, workdir: &str, argv: &[String]) -> Result<ExecOutput> {
        let out = self.output(&Self::exec_args(name, workdir, argv)).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            exit_code: out.status.code(),
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let out = self
            .output(&["rm".to_string(), "-f".to_string(), name.to_string()])
            .await?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if out.status.success() || stderr.contains("No such container") {
            Ok(())
        } else {
            anyhow::bail!("{} rm failed: {}", self.binary, stderr.trim())
        }
    }
}
