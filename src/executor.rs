//! Runs validated commands inside a session container and records the transcript.

use std::sync::Arc;
use std::time::Instant;

use crate::audit::{TranscriptLog, TranscriptRecord};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::runtime::{ContainerRuntime, ExecOutput};
use crate::session::SessionId;

/// Exit code reported when the process was killed by a signal.
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// stdout then stderr, trimmed; prefixed with a failure marker on non-zero exit.
    pub output: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Marker line put in front of the output of a failed command.
pub fn failure_marker(exit_code: i32) -> String {
    format!("[exit code {exit_code}] command failed:")
}

/// Combine captured streams into the text handed back to the caller.
pub fn format_output(captured: &ExecOutput) -> ExecutionResult {
    let exit_code = captured.exit_code.unwrap_or(SIGNALED_EXIT_CODE);
    let combined = format!("{}{}", captured.stdout, captured.stderr);
    let combined = combined.trim();
    let output = if exit_code == 0 {
        combined.to_string()
    } else if combined.is_empty() {
        failure_marker(exit_code)
    } else {
        format!("{}\n{combined}", failure_marker(exit_code))
    };
    ExecutionResult { output, exit_code }
}

/// Executes commands through the container runtime.
pub struct CommandExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    workdir: String,
    shell: String,
    transcript: TranscriptLog,
}

impl CommandExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &BrokerConfig) -> Self {
        Self {
            runtime,
            workdir: config.container.workdir.clone(),
            shell: config.container.shell.clone(),
            transcript: TranscriptLog::new(config.transcript.clone(), config.transcripts_dir()),
        }
    }

    pub fn transcript(&self) -> &TranscriptLog {
        &self.transcript
    }

    /// `<shell> -lc <command>`: the command stays one argument end to end.
    pub fn argv(&self, command: &str) -> Vec<String> {
        vec![self.shell.clone(), "-lc".to_string(), command.to_string()]
    }

    /// Run `command` in `container` and append it to the session transcript.
    pub async fn run(
        &self,
        session: &SessionId,
        container: &str,
        command: &str,
    ) -> Result<ExecutionResult, BrokerError> {
        let started = Instant::now();
        let captured = self
            .runtime
            .exec(container, &self.workdir, &self.argv(command))
            .await
            .map_err(|e| BrokerError::Runtime(format!("{e:#}")))?;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = format_output(&captured);

        tracing::info!(
            session = %session,
            container = %container,
            exit_code = result.exit_code,
            duration_ms,
            "command executed"
        );

        let record = TranscriptRecord::new(session, container, command).with_result(
            &result.output,
            captured.exit_code,
            duration_ms,
        );
        if let Err(e) = self.transcript.append(&record) {
            tracing::warn!(session = %session, error = %e, "failed to append transcript record");
        }
        Ok(result)
    }
}
