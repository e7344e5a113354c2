//! Per-session queue of operator messages that arrive mid-turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Holds messages typed while a turn is active, keyed by session id.
///
/// Queued text is drained in arrival order when the turn next reaches a
/// point where it can forward operator input, and cleared outright when
/// the turn ends so stale nudges never leak into the next turn.
#[derive(Debug, Clone, Default)]
pub struct NudgeQueueStore {
    queues: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl NudgeQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to the session's queue.
    pub fn push(&self, session_id: &str, text: &str) {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues
            .entry(session_id.to_string())
            .or_default()
            .push(text.to_string());
        tracing::debug!(session_id, "queued nudge for active turn");
    }

    /// Atomically takes every queued message for the session, oldest first.
    ///
    /// Take-and-clear happens under one lock so a nudge can never be both
    /// delivered and left behind for the next drain.
    pub fn take_all(&self, session_id: &str) -> Vec<String> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues.remove(session_id).unwrap_or_default()
    }

    /// Drops everything queued for the session without delivering it.
    pub fn clear(&self, session_id: &str) {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if queues.remove(session_id).is_some() {
            tracing::debug!(session_id, "cleared undelivered nudges at turn end");
        }
    }
}
