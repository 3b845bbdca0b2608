//! Side channel for human-visible notes (confirmation codes, progress, debug traces).
//!
//! Notes never travel in the response the calling agent reads; the host routes them to the
//! person supervising the agent.

use parking_lot::Mutex;

/// Sink for human-visible notes.
pub trait Introspector: Send + Sync {
    fn note(&self, message: &str);
}

/// Forwards notes to `tracing` under the `introspect` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingIntrospector;

impl Introspector for TracingIntrospector {
    fn note(&self, message: &str) {
        tracing::info!(target: "introspect", "{message}");
    }
}

/// Keeps notes in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingIntrospector {
    notes: Mutex<Vec<String>>,
}

impl RecordingIntrospector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().clone()
    }

    pub fn clear(&self) {
        self.notes.lock().clear();
    }
}

impl Introspector for RecordingIntrospector {
    fn note(&self, message: &str) {
        self.notes.lock().push(message.to_string());
    }
}
