use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::Role;

/// One finalized transcript record.
///
/// Created only when a turn completes; immutable afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Who spoke
    pub role: Role,

    /// Full accumulated text for the turn
    pub text: String,

    /// When the turn completed
    pub timestamp: DateTime<Utc>,
}

/// Accumulates per-role transcript deltas until a turn completes.
#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    user: String,
    model: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an incremental fragment to the accumulator for `role`.
    pub fn push(&mut self, role: Role, text: &str) {
        match role {
            Role::User => self.user.push_str(text),
            Role::Model => self.model.push_str(text),
        }
    }

    /// Finalize the current turn.
    ///
    /// Emits one entry per role with non-empty accumulated text, user before
    /// model, then resets both accumulators. An empty turn emits nothing.
    pub fn finish_turn(&mut self) -> Vec<TranscriptEntry> {
        let timestamp = Utc::now();
        let mut entries = Vec::new();

        if !self.user.is_empty() {
            entries.push(TranscriptEntry {
                role: Role::User,
                text: std::mem::take(&mut self.user),
                timestamp,
            });
        }

        if !self.model.is_empty() {
            entries.push(TranscriptEntry {
                role: Role::Model,
                text: std::mem::take(&mut self.model),
                timestamp,
            });
        }

        entries
    }

    /// Drop any unfinished fragments without emitting entries.
    ///
    /// Partial turns are discarded on teardown, not flushed.
    pub fn discard(&mut self) {
        self.user.clear();
        self.model.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.model.is_empty()
    }
}
