//! Tool-approval policy and the single-decision handshake slot.

use std::sync::{Arc, Mutex, PoisonError};

use courier_backend::{CapabilityClass, PermissionDecision, PermissionRequest};
use tokio::sync::oneshot;

/// What to do with a tool-approval request before involving the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Answer the backend immediately without surfacing the request.
    AutoApprove,
    /// Suspend the turn and ask the operator.
    Ask,
}

/// Pre-screens approval requests so routine ones never reach the chat.
pub trait PermissionPolicy: Send + Sync {
    fn evaluate(&self, request: &PermissionRequest) -> PolicyVerdict;
}

/// Policy keyed on the request's declared capability class.
///
/// Unknown capabilities are never auto-approved: a backend speaking a newer
/// protocol revision must not gain approvals the operator did not opt into.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityPolicy {
    pub auto_approve_read_only: bool,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            auto_approve_read_only: true,
        }
    }
}

impl PermissionPolicy for CapabilityPolicy {
    fn evaluate(&self, request: &PermissionRequest) -> PolicyVerdict {
        match request.capability {
            CapabilityClass::ReadOnly if self.auto_approve_read_only => PolicyVerdict::AutoApprove,
            _ => PolicyVerdict::Ask,
        }
    }
}

/// Renders the operator-facing prompt line for a pending approval request.
pub(crate) fn permission_prompt_text(request: &PermissionRequest) -> String {
    format!("`{}` wants to: {}", request.tool_name, request.description)
}

/// The operator's answer buttons, in the order they are shown.
pub(crate) fn permission_option_labels() -> Vec<String> {
    vec![
        "Approve once".to_string(),
        "Always approve".to_string(),
        "Reject".to_string(),
    ]
}

/// One-shot slot connecting an external decision (button press, command)
/// to the turn suspended on it.
///
/// The slot holds at most one armed sender; a second decision for the same
/// request finds the slot empty and is ignored, so double taps cannot
/// resolve the handshake twice.
#[derive(Debug, Clone, Default)]
pub(crate) struct DecisionSlot {
    sender: Arc<Mutex<Option<oneshot::Sender<PermissionDecision>>>>,
}

impl DecisionSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arms the slot and returns the receiver the turn loop awaits.
    pub(crate) fn arm(&self) -> oneshot::Receiver<PermissionDecision> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(tx);
        rx
    }

    /// Delivers a decision to the armed waiter. Returns false when the slot
    /// is empty or the waiter is gone.
    pub(crate) fn resolve(&self, decision: PermissionDecision) -> bool {
        let sender = {
            let mut slot = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Drops any armed sender so a late decision cannot resolve a dead turn.
    pub(crate) fn disarm(&self) {
        let mut slot = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }
}
