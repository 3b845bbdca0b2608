//! Command policy: flat-command validation, forbidden commands and patterns, write-path rules.
//!
//! A [`CommandPolicy`] is compiled once from a [`BrokerConfig`] and then only read.

mod command;
mod write_paths;

pub use write_paths::extract_write_targets;

use std::fmt;
use std::path::PathBuf;

use regex::{Regex, RegexBuilder};

use crate::config::BrokerConfig;

/// Why a command was refused by policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Nothing but whitespace was submitted.
    Empty,
    /// The trimmed command exceeds `max_command_length` characters.
    TooLong { limit: usize },
    /// A chaining, substitution or subshell character.
    Metacharacter(char),
    /// A configured forbidden command appears as a whole word. Holds the configured token.
    ForbiddenCommand(String),
    /// A configured forbidden pattern matched. Holds the pattern source.
    ForbiddenPattern(String),
    /// A redirection targets a path outside the writable areas. Holds the unquoted target.
    ForbiddenWritePath(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Rejected: command must not be empty."),
            Self::TooLong { limit } => {
                write!(f, "Rejected: command is too long (maximum {limit} characters).")
            }
            Self::Metacharacter(c) => write!(
                f,
                "Rejected: chained, nested or multi-line shell commands are not allowed (found {}).",
                c.escape_default()
            ),
            Self::ForbiddenCommand(token) => {
                write!(f, "Rejected: command contains forbidden command \"{token}\".")
            }
            Self::ForbiddenPattern(pattern) => {
                write!(f, "Rejected: command matches forbidden pattern {pattern}")
            }
            Self::ForbiddenWritePath(target) => {
                write!(f, "Rejected: writing to {target} is not allowed.")
            }
        }
    }
}

/// Compiled command policy.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    /// Limit on the trimmed command, in characters.
    max_command_length: usize,
    /// (configured token, whole-word matcher)
    forbidden_commands: Vec<(String, Regex)>,
    /// (configured pattern, compiled matcher)
    forbidden_patterns: Vec<(String, Regex)>,
    allowed_write_dirs: Vec<PathBuf>,
    forbidden_write_dirs: Vec<PathBuf>,
    allowed_tmp_write: bool,
    /// In-container project mount; redirections below it are always allowed.
    project_mount: PathBuf,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}

fn case_insensitive(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

impl CommandPolicy {
    /// Compile the policy. Malformed forbidden patterns are skipped with a warning.
    pub fn from_config(config: &BrokerConfig) -> Self {
        let forbidden_commands = config
            .forbidden_commands
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .filter_map(|token| {
                let word = format!(r"\b{}\b", regex::escape(token));
                case_insensitive(&word).ok().map(|re| (token.to_string(), re))
            })
            .collect();

        let forbidden_patterns = config
            .forbidden_patterns
            .iter()
            .filter(|p| !p.trim().is_empty())
            .filter_map(|pattern| match case_insensitive(pattern) {
                Ok(re) => Some((pattern.clone(), re)),
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "skipping malformed forbidden pattern");
                    None
                }
            })
            .collect();

        Self {
            max_command_length: config.max_command_length,
            forbidden_commands,
            forbidden_patterns,
            allowed_write_dirs: config.allowed_write_dirs.clone(),
            forbidden_write_dirs: config.forbidden_write_dirs.clone(),
            allowed_tmp_write: config.allowed_tmp_write,
            project_mount: PathBuf::from(&config.container.workdir),
        }
    }

    /// Number of forbidden patterns that compiled.
    pub fn active_pattern_count(&self) -> usize {
        self.forbidden_patterns.len()
    }
}

/// Human-readable summary of the active policy, shown once per session.
pub fn policy_summary(config: &BrokerConfig) -> String {
    let mut out = String::from("Sandbox shell policy for this session:\n");
    out.push_str(&format!(
        "- Commands run inside a dedicated container ({}) with the project mounted at {}.\n",
        config.container.image, config.container.workdir
    ));
    out.push_str(&format!(
        "- One flat command per request, at most {} characters; no ; | & ` $ ( ) \\ or newlines.\n",
        config.max_command_length
    ));
    if !config.forbidden_commands.is_empty() {
        out.push_str(&format!(
            "- Forbidden commands: {}.\n",
            config.forbidden_commands.join(", ")
        ));
    }
    if !config.whitelist_commands.is_empty() {
        let mode = if config.always_allow_whitelist {
            "run without confirmation"
        } else {
            "still require confirmation"
        };
        out.push_str(&format!(
            "- Whitelisted commands ({mode}): {}.\n",
            config.whitelist_commands.join(", ")
        ));
    }
    let mut writable = vec![config.container.workdir.clone()];
    writable.extend(
        config
            .allowed_write_dirs
            .iter()
            .map(|d| d.display().to_string()),
    );
    if config.allowed_tmp_write {
        writable.push("/tmp".into());
    }
    out.push_str(&format!(
        "- Output redirection may only target: {}.\n",
        writable.join(", ")
    ));
    out.push_str(&format!(
        "- Every other command needs a 6-digit confirmation code from the user, valid for {} seconds.\n",
        config.max_challenge_age_secs
    ));
    out
}
