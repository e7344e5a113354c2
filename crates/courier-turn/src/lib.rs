//! Turn orchestration core for the Courier relay.
//!
//! Drives one conversational turn from prompt submission to a deterministic
//! terminal state: merges the push event stream with the pull-based status
//! poller into one transcript, suspends for tool-approval handshakes,
//! throttles outward renders through the update gate, and guarantees
//! single-exit teardown under cancellation, partial failure, or backend
//! disconnection.

mod cancel;
mod nudge_queue;
mod orchestrator;
mod permission;
mod poller;
mod registry;
mod turn_loop;
mod turn_state;

pub use cancel::TurnCancellationToken;
pub use nudge_queue::NudgeQueueStore;
pub use orchestrator::{InputRouting, TurnOrchestrator, TurnRuntimeConfig};
pub use permission::{CapabilityPolicy, PermissionPolicy, PolicyVerdict};
pub use registry::{TurnKey, TurnRegistry};
pub use turn_state::{ToolRecord, TurnOutcome, TurnPhase, TurnState, UsageTotals};

use thiserror::Error;

/// Enumerates failures `run_turn` can surface to the embedding adapter.
///
/// Backend trouble mid-turn does not appear here: it is absorbed into a
/// terminal "failed" render so every turn still reaches a terminal state.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("a turn is already active for this chat session")]
    AlreadyActive,
}
