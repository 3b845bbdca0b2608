//! The broker: one request in, one terminal response out.
//!
//! Evaluation order per request (first applicable step wins):
//! 1. missing or malformed session id: mint one and return the setup message;
//! 2. session not yet notified: mark it and return the policy summary;
//! 3. destroy request: gated by its own confirmation code;
//! 4. project path must name an existing directory;
//! 5. command must pass the validator;
//! 6. whitelisted command with bypass enabled: execute immediately;
//! 7. write-path guard, then the confirmation-code challenge, then execute.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::challenge::{Challenge, ChallengeStore, ChallengeSubject, VerifyOutcome};
use crate::config::BrokerConfig;
use crate::container::{resolve_project_path, ContainerManager};
use crate::error::BrokerError;
use crate::executor::{CommandExecutor, ExecutionResult};
use crate::introspect::Introspector;
use crate::persistence::{FileStore, KeyedStore};
use crate::policy::{policy_summary, CommandPolicy, Rejection};
use crate::runtime::ContainerRuntime;
use crate::session::{Notification, SessionId, SessionRegistry};

/// A single call from the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRequest {
    /// Session token from an earlier setup response. Missing or malformed ids get a new one.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Host directory mounted into the session container.
    #[serde(default)]
    pub project_path: Option<String>,
    /// One flat shell command.
    #[serde(default)]
    pub command: Option<String>,
    /// Code the user read from the side channel, if the caller has one.
    #[serde(default)]
    pub confirmation_code: Option<String>,
    /// Remove the session container instead of running a command.
    #[serde(default)]
    pub destroy_container: bool,
}

impl BrokerRequest {
    /// A command request without a confirmation code.
    pub fn command(session_id: &str, project_path: &str, command: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            project_path: Some(project_path.to_string()),
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Attach a confirmation code.
    pub fn with_code(mut self, code: &str) -> Self {
        self.confirmation_code = Some(code.to_string());
        self
    }
}

/// Terminal, non-error outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerResponse {
    /// A session id was minted; nothing ran.
    Setup { session_id: SessionId, summary: String },
    /// First contact for this session; nothing ran.
    PolicySummary { summary: String },
    /// Refused by the validator or the write-path guard. No challenge was issued.
    Rejected(Rejection),
    /// A code was issued through the side channel.
    AwaitingCode,
    /// Wrong code; the challenge stays pending for `attempts_left` more tries.
    CodeMismatch { attempts_left: u32 },
    /// Too many wrong codes; the pending challenge was dropped.
    ChallengeRevoked,
    /// The command ran; its exit code may still be non-zero.
    Executed(ExecutionResult),
    /// The session container was removed.
    ContainerDestroyed { container: String },
}

impl fmt::Display for BrokerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup {
                session_id,
                summary,
            } => write!(
                f,
                "A new session id was generated:\n\n{session_id}\n\n\
                 Use this session id for every further command in this chat.\n\n{summary}"
            ),
            Self::PolicySummary { summary } => {
                write!(f, "{summary}\nResubmit the command to continue.")
            }
            Self::Rejected(reason) => write!(f, "{reason}"),
            Self::AwaitingCode => write!(f, "Waiting for the confirmation code from the user..."),
            Self::CodeMismatch { attempts_left } => write!(
                f,
                "Confirmation code is wrong or expired ({attempts_left} attempt(s) left). \
                 Ask the user for the code or resubmit the command for a new one."
            ),
            Self::ChallengeRevoked => write!(
                f,
                "Too many wrong confirmation codes; the pending request was cancelled. \
                 Resubmit the command to request a new code."
            ),
            Self::Executed(result) => f.write_str(&result.output),
            Self::ContainerDestroyed { container } => write!(
                f,
                "Container {container} was removed. A fresh one is created on the next command."
            ),
        }
    }
}

/// Composes policy, challenges, session registry, containers and execution.
pub struct Broker {
    config: BrokerConfig,
    policy: CommandPolicy,
    challenges: ChallengeStore,
    registry: SessionRegistry,
    containers: ContainerManager,
    executor: CommandExecutor,
    introspect: Arc<dyn Introspector>,
}

impl Broker {
    /// Broker persisting its state as files under `config.state_dir`.
    pub fn new(
        config: BrokerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        introspect: Arc<dyn Introspector>,
    ) -> Self {
        let challenges: Arc<dyn KeyedStore<Challenge>> =
            Arc::new(FileStore::new(config.challenges_path()));
        let notifications: Arc<dyn KeyedStore<Notification>> =
            Arc::new(FileStore::new(config.notifications_path()));
        Self::with_stores(config, runtime, challenges, notifications, introspect)
    }

    pub fn with_stores(
        config: BrokerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        challenges: Arc<dyn KeyedStore<Challenge>>,
        notifications: Arc<dyn KeyedStore<Notification>>,
        introspect: Arc<dyn Introspector>,
    ) -> Self {
        Self {
            policy: CommandPolicy::from_config(&config),
            challenges: ChallengeStore::from_config(challenges, &config),
            registry: SessionRegistry::new(notifications),
            containers: ContainerManager::new(Arc::clone(&runtime), &config),
            executor: CommandExecutor::new(runtime, &config),
            introspect,
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    fn debug(&self, message: &str) {
        if self.config.enable_introspect_debug {
            self.introspect.note(&format!("[debug] {message}"));
        }
    }

    /// Handle one request.
    pub async fn handle(&self, request: BrokerRequest) -> Result<BrokerResponse, BrokerError> {
        let Some(session) = request.session_id.as_deref().and_then(SessionId::parse) else {
            let session_id = SessionId::generate();
            tracing::info!(session = %session_id, "minted new session id");
            return Ok(BrokerResponse::Setup {
                session_id,
                summary: policy_summary(&self.config),
            });
        };

        if self.registry.mark_notified(&session)? {
            tracing::info!(session = %session, "delivered policy summary");
            return Ok(BrokerResponse::PolicySummary {
                summary: policy_summary(&self.config),
            });
        }

        if request.destroy_container {
            return self
                .handle_destroy(&session, request.confirmation_code.as_deref())
                .await;
        }

        let project_raw = request.project_path.as_deref().unwrap_or_default();
        let project = resolve_project_path(request.project_path.as_deref())?;

        let command = request.command.as_deref().unwrap_or_default();
        if let Err(reason) = self.policy.validate_command(command) {
            tracing::info!(session = %session, %reason, "command rejected by policy");
            return Ok(BrokerResponse::Rejected(reason));
        }

        if self.config.always_allow_whitelist && self.config.is_whitelisted(command) {
            tracing::debug!(session = %session, "whitelisted command bypasses confirmation");
            return self.execute(&session, &project, command).await;
        }

        if let Err(reason) = self.policy.check_write_paths(command) {
            tracing::info!(session = %session, %reason, "write target rejected by policy");
            return Ok(BrokerResponse::Rejected(reason));
        }

        let subject = ChallengeSubject::command(command, project_raw);
        match self.confirm(&session, subject, request.confirmation_code.as_deref())? {
            Some(blocked) => Ok(blocked),
            None => self.execute(&session, &project, command).await,
        }
    }

    async fn handle_destroy(
        &self,
        session: &SessionId,
        code: Option<&str>,
    ) -> Result<BrokerResponse, BrokerError> {
        if let Some(blocked) = self.confirm(session, ChallengeSubject::DestroyContainer, code)? {
            return Ok(blocked);
        }
        let container = self.containers.destroy(session).await?;
        self.introspect
            .note(&format!("Removed container {container}."));
        Ok(BrokerResponse::ContainerDestroyed { container })
    }

    /// Run the challenge gate. `None` means the code matched and the action may proceed.
    fn confirm(
        &self,
        session: &SessionId,
        subject: ChallengeSubject,
        code: Option<&str>,
    ) -> Result<Option<BrokerResponse>, BrokerError> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return self.issue(session, subject).map(Some);
        };
        match self.challenges.verify(session, &subject, code)? {
            VerifyOutcome::Matched => {
                tracing::info!(session = %session, "confirmation code accepted");
                Ok(None)
            }
            VerifyOutcome::Mismatched { attempts_left } => {
                tracing::warn!(session = %session, attempts_left, "wrong confirmation code");
                Ok(Some(BrokerResponse::CodeMismatch { attempts_left }))
            }
            VerifyOutcome::Revoked => {
                tracing::warn!(session = %session, "challenge revoked after repeated wrong codes");
                Ok(Some(BrokerResponse::ChallengeRevoked))
            }
            VerifyOutcome::Expired | VerifyOutcome::NoChallenge => {
                self.issue(session, subject).map(Some)
            }
        }
    }

    fn issue(
        &self,
        session: &SessionId,
        subject: ChallengeSubject,
    ) -> Result<BrokerResponse, BrokerError> {
        let prompt = match &subject {
            ChallengeSubject::Command { command, .. } => format!("run `{command}`"),
            ChallengeSubject::DestroyContainer => format!(
                "remove container {}",
                self.containers.container_name(session)
            ),
        };
        let code = self.challenges.issue(session, subject)?;
        self.introspect.note(&format!(
            "Security check: to {prompt}, enter this code: **{code}** (valid for {} seconds)",
            self.config.max_challenge_age_secs
        ));
        self.debug(&format!("challenge issued for session {session}"));
        tracing::info!(session = %session, "confirmation code issued");
        Ok(BrokerResponse::AwaitingCode)
    }

    async fn execute(
        &self,
        session: &SessionId,
        project: &Path,
        command: &str,
    ) -> Result<BrokerResponse, BrokerError> {
        let container = self.containers.ensure_running(session, project).await?;
        if container.started {
            self.debug(&format!(
                "started container {} as user {}",
                container.name,
                self.config.container.run_as().unwrap_or("root")
            ));
        }
        self.introspect
            .note(&format!("Running in container {}: {command}", container.name));
        let result = self.executor.run(session, &container.name, command).await?;
        Ok(BrokerResponse::Executed(result))
    }
}
