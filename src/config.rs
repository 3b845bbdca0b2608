//! Broker configuration: command policy, write rules, challenge limits, container defaults.
//!
//! Every field has a default, so a partial (or empty) configuration file still yields a
//! complete policy. The broker reads one `BrokerConfig` per invocation and never mutates it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

// ── Broker ─────────────────────────────────────────────────────────

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Maximum length (in characters) of a trimmed command.
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
    /// Command names rejected as whole words, case-insensitively.
    #[serde(default = "default_forbidden_commands")]
    pub forbidden_commands: Vec<String>,
    /// Case-insensitive regular expressions rejecting matching commands.
    #[serde(default = "default_forbidden_patterns")]
    pub forbidden_patterns: Vec<String>,
    /// Exact commands that may skip the confirmation code when bypass is enabled.
    #[serde(default)]
    pub whitelist_commands: Vec<String>,
    /// Let whitelisted commands run without a confirmation code.
    #[serde(default)]
    pub always_allow_whitelist: bool,
    /// Absolute directories that output redirections may target.
    #[serde(default)]
    pub allowed_write_dirs: Vec<PathBuf>,
    /// Absolute directories that output redirections may never target. Wins over allowed dirs.
    #[serde(default = "default_forbidden_write_dirs")]
    pub forbidden_write_dirs: Vec<PathBuf>,
    /// Allow redirections into `/tmp`.
    #[serde(default = "default_true")]
    pub allowed_tmp_write: bool,
    /// Seconds a confirmation code stays valid.
    #[serde(default = "default_max_challenge_age_secs")]
    pub max_challenge_age_secs: u64,
    /// Wrong codes tolerated before a pending challenge is revoked.
    #[serde(default = "default_max_code_attempts")]
    pub max_code_attempts: u32,
    /// Emit `[debug]` introspection notes.
    #[serde(default)]
    pub enable_introspect_debug: bool,
    /// Directory holding challenges, notifications, transcripts and locks.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub transcript: TranscriptConfig,
}

fn default_true() -> bool {
    true
}
fn default_max_command_length() -> usize {
    256
}
fn default_max_challenge_age_secs() -> u64 {
    180
}
fn default_max_code_attempts() -> u32 {
    5
}
fn default_state_dir() -> PathBuf {
    PathBuf::from(".sandbox-broker")
}

fn default_forbidden_commands() -> Vec<String> {
    [
        "sudo", "su", "shutdown", "reboot", "halt", "poweroff", "mkfs", "dd", "mount", "umount",
        "passwd", "useradd", "userdel", "usermod", "iptables",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_forbidden_patterns() -> Vec<String> {
    vec![
        r"rm\s+-[a-z]*r[a-z]*\s+/\s*$".into(),
        r"rm\s+-[a-z]*r[a-z]*\s+/\*".into(),
        r"chmod\s+(-r\s+)?777".into(),
    ]
}

fn default_forbidden_write_dirs() -> Vec<PathBuf> {
    [
        "/etc", "/usr", "/bin", "/sbin", "/lib", "/boot", "/dev", "/proc", "/sys", "/root", "/var",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_command_length: default_max_command_length(),
            forbidden_commands: default_forbidden_commands(),
            forbidden_patterns: default_forbidden_patterns(),
            whitelist_commands: Vec::new(),
            always_allow_whitelist: false,
            allowed_write_dirs: Vec::new(),
            forbidden_write_dirs: default_forbidden_write_dirs(),
            allowed_tmp_write: true,
            max_challenge_age_secs: default_max_challenge_age_secs(),
            max_code_attempts: default_max_code_attempts(),
            enable_introspect_debug: false,
            state_dir: default_state_dir(),
            container: ContainerConfig::default(),
            transcript: TranscriptConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Read a JSON configuration file. Absent keys fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!(
                "cannot read configuration {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            BrokerError::Configuration(format!("invalid configuration {}: {e}", path.display()))
        })
    }

    /// How long an issued code stays usable.
    pub fn max_challenge_age(&self) -> chrono::Duration {
        i64::try_from(self.max_challenge_age_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Whether `command` (trimmed) is an exact whitelist entry.
    pub fn is_whitelisted(&self, command: &str) -> bool {
        let command = command.trim();
        self.whitelist_commands.iter().any(|w| w.trim() == command)
    }

    pub fn challenges_path(&self) -> PathBuf {
        self.state_dir.join("challenges.json")
    }

    pub fn notifications_path(&self) -> PathBuf {
        self.state_dir.join("notified.json")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.state_dir.join("transcripts")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }
}

// ── Container ──────────────────────────────────────────────────────

/// Per-session container options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Docker-compatible CLI used as the execution service (`docker`, `podman`).
    #[serde(default = "default_runtime_binary")]
    pub runtime_binary: String,
    #[serde(default = "default_image")]
    pub image: String,
    /// User commands run as. `root` means no `--user` flag.
    #[serde(default = "default_user")]
    pub user: String,
    /// Container names are `name_prefix + session id`.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Mount point of the project directory, also the working directory.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Shell that runs each command as `<shell> -lc <command>`.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    /// Readiness checks after creation before giving up.
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    /// First readiness back-off delay; doubles on every retry.
    #[serde(default = "default_ready_initial_delay_ms")]
    pub ready_initial_delay_ms: u64,
}

fn default_runtime_binary() -> String {
    "docker".into()
}
fn default_image() -> String {
    "ubuntu:24.04".into()
}
fn default_user() -> String {
    "root".into()
}
fn default_name_prefix() -> String {
    "sandbox_".into()
}
fn default_workdir() -> String {
    "/sandbox/project".into()
}
fn default_shell() -> String {
    "bash".into()
}
fn default_ready_attempts() -> u32 {
    5
}
fn default_ready_initial_delay_ms() -> u64 {
    250
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime_binary: default_runtime_binary(),
            image: default_image(),
            user: default_user(),
            name_prefix: default_name_prefix(),
            workdir: default_workdir(),
            shell: default_shell(),
            network: None,
            memory_limit_mb: None,
            cpu_limit: None,
            ready_attempts: default_ready_attempts(),
            ready_initial_delay_ms: default_ready_initial_delay_ms(),
        }
    }
}

impl ContainerConfig {
    /// The `--user` value, or `None` when commands should run as root.
    pub fn run_as(&self) -> Option<&str> {
        let user = self.user.trim();
        if user.is_empty() || user == "root" || user == "0" {
            None
        } else {
            Some(user)
        }
    }
}

// ── Transcript ─────────────────────────────────────────────────────

/// Per-session execution transcript options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rotate a session transcript once it reaches this size.
    #[serde(default = "default_transcript_max_size_mb")]
    pub max_size_mb: u32,
}

fn default_transcript_max_size_mb() -> u32 {
    10
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: default_transcript_max_size_mb(),
        }
    }
}
