//! Session identifiers and the one-time policy notification registry.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::persistence::KeyedStore;

/// Opaque caller-held session token matching `[A-Za-z0-9_-]{3,40}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh id (32 lowercase hex characters).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accept `raw` only if it has the session id shape.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid_len = (3..=40).contains(&raw.len());
        let valid_chars = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        (valid_len && valid_chars).then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-session record of whether the policy summary was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notified_at: chrono::DateTime<chrono::Utc>,
}

/// Tracks which sessions have already been shown the policy summary.
pub struct SessionRegistry {
    store: Arc<dyn KeyedStore<Notification>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn KeyedStore<Notification>>) -> Self {
        Self { store }
    }

    pub fn has_been_notified(&self, session: &SessionId) -> Result<bool, StoreError> {
        Ok(self.store.get(session.as_str())?.is_some())
    }

    /// Mark the session notified. Returns `true` if this call set the flag.
    pub fn mark_notified(&self, session: &SessionId) -> Result<bool, StoreError> {
        let mut newly = false;
        self.store.update(session.as_str(), &mut |slot| {
            if slot.is_none() {
                *slot = Some(Notification {
                    notified_at: chrono::Utc::now(),
                });
                newly = true;
            }
        })?;
        Ok(newly)
    }
}
