//! One-time confirmation codes bound to a session and the exact action they approve.
//!
//! A session holds at most one pending challenge; issuing overwrites it. A code is usable only
//! for the identical subject, only within the configured age, and only once: a match deletes
//! the challenge in the same locked update that checked it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::BrokerConfig;
use crate::error::StoreError;
use crate::persistence::KeyedStore;
use crate::session::SessionId;

/// The action a code approves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChallengeSubject {
    Command {
        command: String,
        project_path: String,
    },
    DestroyContainer,
}

impl ChallengeSubject {
    pub fn command(command: &str, project_path: &str) -> Self {
        Self::Command {
            command: command.to_string(),
            project_path: project_path.to_string(),
        }
    }
}

/// Persisted pending challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub subject: ChallengeSubject,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub failed_attempts: u32,
}

/// Result of checking a supplied code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Code accepted; the challenge is gone.
    Matched,
    /// Wrong code; the challenge stays pending.
    Mismatched { attempts_left: u32 },
    /// Same subject, but older than the maximum age.
    Expired,
    /// Nothing pending for this subject.
    NoChallenge,
    /// Wrong code and the attempt budget is spent; the challenge was deleted.
    Revoked,
}

/// Six decimal digits, never with a leading zero.
pub fn generate_code() -> String {
    rand::rng().random_range(100_000..=999_999u32).to_string()
}

/// Constant-time comparison of a stored code with user input.
fn codes_match(expected: &str, supplied: &str) -> bool {
    expected.as_bytes().ct_eq(supplied.trim().as_bytes()).into()
}

/// Issues, verifies and consumes confirmation codes.
pub struct ChallengeStore {
    store: Arc<dyn KeyedStore<Challenge>>,
    max_age: Duration,
    max_attempts: u32,
}

impl ChallengeStore {
    pub fn new(store: Arc<dyn KeyedStore<Challenge>>, max_age: Duration, max_attempts: u32) -> Self {
        Self {
            store,
            max_age,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(store: Arc<dyn KeyedStore<Challenge>>, config: &BrokerConfig) -> Self {
        Self::new(store, config.max_challenge_age(), config.max_code_attempts)
    }

    /// Issue a new code for `subject`, replacing whatever was pending for the session.
    pub fn issue(&self, session: &SessionId, subject: ChallengeSubject) -> Result<String, StoreError> {
        self.issue_at(session, subject, Utc::now())
    }

    pub fn issue_at(
        &self,
        session: &SessionId,
        subject: ChallengeSubject,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let code = generate_code();
        let mut pending = Some(Challenge {
            subject,
            code: code.clone(),
            issued_at: now,
            failed_attempts: 0,
        });
        self.store
            .update(session.as_str(), &mut |slot| *slot = pending.take())?;
        Ok(code)
    }

    /// Check `code` against the pending challenge for `subject`. Consumes it on a match.
    pub fn verify(
        &self,
        session: &SessionId,
        subject: &ChallengeSubject,
        code: &str,
    ) -> Result<VerifyOutcome, StoreError> {
        self.verify_at(session, subject, code, Utc::now())
    }

    pub fn verify_at(
        &self,
        session: &SessionId,
        subject: &ChallengeSubject,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome, StoreError> {
        let mut outcome = VerifyOutcome::NoChallenge;
        let max_age = self.max_age;
        let max_attempts = self.max_attempts;
        self.store.update(session.as_str(), &mut |slot| {
            outcome = match slot.as_mut() {
                None => VerifyOutcome::NoChallenge,
                Some(pending) if pending.subject != *subject => VerifyOutcome::NoChallenge,
                Some(pending) if now - pending.issued_at > max_age => VerifyOutcome::Expired,
                Some(pending) if codes_match(&pending.code, code) => {
                    *slot = None;
                    VerifyOutcome::Matched
                }
                Some(pending) => {
                    pending.failed_attempts += 1;
                    if pending.failed_attempts >= max_attempts {
                        *slot = None;
                        VerifyOutcome::Revoked
                    } else {
                        VerifyOutcome::Mismatched {
                            attempts_left: max_attempts - pending.failed_attempts,
                        }
                    }
                }
            };
        })?;
        Ok(outcome)
    }

    /// The pending challenge for a session, if any.
    pub fn pending(&self, session: &SessionId) -> Result<Option<Challenge>, StoreError> {
        self.store.get(session.as_str())
    }
}
