use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::{CommandPolicy, Rejection};

static REDIRECTION_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#">{1,2}\s*((?:"[^"]*"|'[^']*'|[^\s|&;'"])+)"#)
        .expect("redirection regex is valid")
});

const TMP_DIR: &str = "/tmp";

/// Targets of every `>` / `>>` redirection in `command`, in order of appearance.
///
/// Quotes are removed the way the shell removes them, so `"/etc/x"` and `'/e'tc/x` both
/// yield `/etc/x`.
pub fn extract_write_targets(command: &str) -> Vec<String> {
    REDIRECTION_TARGET
        .captures_iter(command)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().chars().filter(|c| !matches!(c, '"' | '\'')).collect())
        .collect()
}

/// Lexically resolve `.` and `..` in an absolute path. `..` never climbs above `/`.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if out.parent().is_some() {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl CommandPolicy {
    /// Whether an absolute redirection target may be written. Forbidden dirs win.
    pub fn is_write_path_allowed(&self, target: &Path) -> bool {
        if !target.is_absolute() {
            return true;
        }
        let target = normalize(target);
        if self
            .forbidden_write_dirs
            .iter()
            .any(|dir| target.starts_with(normalize(dir)))
        {
            return false;
        }
        target.starts_with(&self.project_mount)
            || self
                .allowed_write_dirs
                .iter()
                .any(|dir| target.starts_with(normalize(dir)))
            || (self.allowed_tmp_write && target.starts_with(TMP_DIR))
    }

    /// Reject the command if any redirection target is not writable.
    pub fn check_write_paths(&self, command: &str) -> Result<(), Rejection> {
        match extract_write_targets(command)
            .into_iter()
            .find(|t| !self.is_write_path_allowed(Path::new(t)))
        {
            Some(target) => Err(Rejection::ForbiddenWritePath(target)),
            None => Ok(()),
        }
    }
}
