//! Public entry point: routes operator input and owns per-turn lifecycle.

use std::sync::Arc;
use std::time::Duration;

use courier_backend::{AgentBackend, PermissionDecision};
use courier_chat::ChatSurface;

use crate::nudge_queue::NudgeQueueStore;
use crate::permission::{CapabilityPolicy, PermissionPolicy};
use crate::registry::{TurnKey, TurnRegistry};
use crate::turn_loop::{drive_turn, TurnContext};
use crate::turn_state::TurnOutcome;
use crate::TurnError;

/// Tunables for the turn runtime. Defaults match an interactive chat
/// surface with coarse edit quotas.
#[derive(Debug, Clone, Copy)]
pub struct TurnRuntimeConfig {
    /// Minimum wall-clock spacing between outward renders.
    pub min_update_interval: Duration,
    /// Minimum character delta before an unforced render goes out.
    pub min_update_delta_chars: usize,
    /// Hard per-message character ceiling of the chat surface.
    pub max_chunk_chars: usize,
    pub poll_initial_interval: Duration,
    pub poll_max_interval: Duration,
    /// Consecutive unchanged polls before the pull channel may settle.
    pub poll_stable_cycles: u32,
    /// Minimum quiet time before the pull channel may settle.
    pub poll_min_stable: Duration,
    /// Spacing of "typing" keepalives while a turn is working.
    pub typing_interval: Duration,
    /// Overall wall-clock ceiling for one turn; `None` disables it.
    pub turn_timeout: Option<Duration>,
}

impl Default for TurnRuntimeConfig {
    fn default() -> Self {
        Self {
            min_update_interval: Duration::from_millis(1_500),
            min_update_delta_chars: 24,
            max_chunk_chars: 3_500,
            poll_initial_interval: Duration::from_millis(500),
            poll_max_interval: Duration::from_millis(5_000),
            poll_stable_cycles: 3,
            poll_min_stable: Duration::from_millis(10_000),
            typing_interval: Duration::from_secs(5),
            turn_timeout: None,
        }
    }
}

/// What happened to one piece of operator input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRouting {
    /// The input started a turn, which ran to this terminal state.
    TurnFinished(TurnOutcome),
    /// A turn was already active; the input was queued as a nudge.
    QueuedForActiveTurn,
}

/// Relays operator input into agent turns and turn state back out.
///
/// One orchestrator serves many chat/session pairs; per-turn state lives in
/// the registry and inside each running `drive_turn` call.
pub struct TurnOrchestrator {
    backend: Arc<dyn AgentBackend>,
    surface: Arc<dyn ChatSurface>,
    policy: Arc<dyn PermissionPolicy>,
    registry: TurnRegistry,
    nudges: NudgeQueueStore,
    config: TurnRuntimeConfig,
}

impl TurnOrchestrator {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        surface: Arc<dyn ChatSurface>,
        config: TurnRuntimeConfig,
    ) -> Self {
        Self {
            backend,
            surface,
            policy: Arc::new(CapabilityPolicy::default()),
            registry: TurnRegistry::new(),
            nudges: NudgeQueueStore::new(),
            config,
        }
    }

    /// Replaces the default capability-based approval policy.
    pub fn with_policy(mut self, policy: Arc<dyn PermissionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &TurnRegistry {
        &self.registry
    }

    /// Routes one operator message: starts a turn when the key is free,
    /// queues a nudge when one is already running. Resolves when the
    /// started turn reaches its terminal state.
    pub async fn handle_message(&self, key: &TurnKey, text: &str) -> InputRouting {
        match self.run_turn(key, text).await {
            Ok(outcome) => InputRouting::TurnFinished(outcome),
            Err(TurnError::AlreadyActive) => {
                self.nudges.push(&key.session_id, text);
                InputRouting::QueuedForActiveTurn
            }
        }
    }

    /// Runs one turn for the key, failing fast when one is already active.
    pub async fn run_turn(&self, key: &TurnKey, prompt: &str) -> Result<TurnOutcome, TurnError> {
        let handle = self.registry.begin(key)?;
        tracing::debug!(
            chat_id = key.chat_id.as_str(),
            session_id = key.session_id.as_str(),
            "turn started"
        );
        let ctx = TurnContext {
            backend: self.backend.clone(),
            surface: self.surface.clone(),
            policy: self.policy.clone(),
            nudges: self.nudges.clone(),
            session_id: key.session_id.clone(),
            config: self.config,
            cancel: handle.cancel.clone(),
            decisions: handle.decisions.clone(),
        };
        let outcome = drive_turn(ctx, prompt.to_string()).await;
        self.registry.end(key);
        // Nudges that never found a delivery point die with their turn.
        self.nudges.clear(&key.session_id);
        tracing::debug!(
            chat_id = key.chat_id.as_str(),
            session_id = key.session_id.as_str(),
            outcome = ?outcome,
            "turn finished"
        );
        Ok(outcome)
    }

    /// Stop-button handler. Returns false when no turn is active, which the
    /// caller reports as "nothing to stop".
    pub fn request_stop(&self, key: &TurnKey) -> bool {
        self.registry.request_stop(key)
    }

    /// Approval-button handler. Returns false when no turn is waiting on a
    /// decision, so duplicate taps and stale buttons are inert.
    pub fn resolve_permission(&self, key: &TurnKey, decision: PermissionDecision) -> bool {
        self.registry.resolve_permission(key, decision)
    }
}
