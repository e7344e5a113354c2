//! Tracks which chat/session pairs have a turn in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use courier_backend::PermissionDecision;

use crate::cancel::TurnCancellationToken;
use crate::permission::DecisionSlot;
use crate::TurnError;

/// Identity of one active turn: a chat surface conversation bound to a
/// backend session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurnKey {
    pub chat_id: String,
    pub session_id: String,
}

/// Live control handles for an active turn.
#[derive(Debug, Clone)]
pub(crate) struct TurnHandle {
    pub cancel: TurnCancellationToken,
    pub decisions: DecisionSlot,
}

/// Registry of active turns.
///
/// At most one turn may be active per key; external controls (stop button,
/// approval buttons) look their turn up here so they reach the right
/// in-flight loop or fall away harmlessly when the turn is already gone.
#[derive(Debug, Clone, Default)]
pub struct TurnRegistry {
    active: Arc<Mutex<HashMap<TurnKey, TurnHandle>>>,
}

impl TurnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the key for a new turn, handing back its control handles.
    pub(crate) fn begin(&self, key: &TurnKey) -> Result<TurnHandle, TurnError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(key) {
            return Err(TurnError::AlreadyActive);
        }
        let handle = TurnHandle {
            cancel: TurnCancellationToken::new(),
            decisions: DecisionSlot::new(),
        };
        active.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    /// Releases the key once its turn reached a terminal state.
    pub(crate) fn end(&self, key: &TurnKey) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.remove(key);
    }

    /// True while a turn holds the key.
    pub fn is_active(&self, key: &TurnKey) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.contains_key(key)
    }

    /// Requests cancellation of the key's turn. Returns false when no turn
    /// is active, which callers treat as "already stopped".
    pub fn request_stop(&self, key: &TurnKey) -> bool {
        let handle = {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.get(key).cloned()
        };
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forwards an approval decision to the turn suspended on it. Returns
    /// false when no turn is waiting, so duplicate button taps are inert.
    pub fn resolve_permission(&self, key: &TurnKey, decision: PermissionDecision) -> bool {
        let handle = {
            let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            active.get(key).cloned()
        };
        match handle {
            Some(handle) => handle.decisions.resolve(decision),
            None => false,
        }
    }
}
