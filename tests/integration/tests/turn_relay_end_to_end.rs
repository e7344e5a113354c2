//! End-to-end relay tests: operator input in, deterministic renders out,
//! exercised only through the public orchestrator surface.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_backend::{
    AgentBackend, BackendError, BackendEvent, CapabilityClass, CompletedStep, EventStream,
    MessageSnapshot, PermissionDecision, PermissionRequest, PromptHandle, StepUsage,
};
use courier_chat::{ChatSendError, ChatSurface, KeyboardKind};
use courier_turn::{InputRouting, TurnKey, TurnOrchestrator, TurnOutcome, TurnRuntimeConfig};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

struct ScriptedBackend {
    submitted_prompts: Mutex<Vec<String>>,
    event_feed: Mutex<Option<mpsc::UnboundedReceiver<Result<BackendEvent, BackendError>>>>,
    snapshots: Mutex<VecDeque<MessageSnapshot>>,
    permission_acks: Mutex<Vec<(String, PermissionDecision)>>,
    aborted_sessions: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(
        snapshots: Vec<MessageSnapshot>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedSender<Result<BackendEvent, BackendError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            submitted_prompts: Mutex::new(Vec::new()),
            event_feed: Mutex::new(Some(rx)),
            snapshots: Mutex::new(snapshots.into()),
            permission_acks: Mutex::new(Vec::new()),
            aborted_sessions: Mutex::new(Vec::new()),
        });
        (backend, tx)
    }

    fn submitted_prompts(&self) -> Vec<String> {
        self.submitted_prompts.lock().unwrap().clone()
    }

    fn permission_acks(&self) -> Vec<(String, PermissionDecision)> {
        self.permission_acks.lock().unwrap().clone()
    }

    fn aborted_sessions(&self) -> Vec<String> {
        self.aborted_sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn submit_prompt(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<PromptHandle, BackendError> {
        self.submitted_prompts.lock().unwrap().push(text.to_string());
        Ok(PromptHandle {
            session_id: session_id.to_string(),
            message_id: "m1".to_string(),
        })
    }

    async fn subscribe(&self, _session_id: &str) -> Result<EventStream, BackendError> {
        let rx = self
            .event_feed
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BackendError::Protocol("already subscribed".into()))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn get_message(
        &self,
        _session_id: &str,
        _message_id: &str,
    ) -> Result<MessageSnapshot, BackendError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        match snapshots.len() {
            0 => Err(BackendError::Unreachable("no snapshot scripted".into())),
            1 => Ok(snapshots[0].clone()),
            _ => Ok(snapshots.pop_front().expect("checked non-empty")),
        }
    }

    async fn respond_permission(
        &self,
        _session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), BackendError> {
        self.permission_acks
            .lock()
            .unwrap()
            .push((request_id.to_string(), decision));
        Ok(())
    }

    async fn abort(&self, session_id: &str) -> Result<(), BackendError> {
        self.aborted_sessions
            .lock()
            .unwrap()
            .push(session_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSurface {
    renders: Mutex<Vec<(String, KeyboardKind)>>,
    permission_prompts: Mutex<Vec<String>>,
}

impl RecordingSurface {
    fn renders(&self) -> Vec<(String, KeyboardKind)> {
        self.renders.lock().unwrap().clone()
    }

    fn permission_prompts(&self) -> Vec<String> {
        self.permission_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSurface for RecordingSurface {
    async fn render(&self, text: &str, keyboard: KeyboardKind) -> Result<(), ChatSendError> {
        self.renders
            .lock()
            .unwrap()
            .push((text.to_string(), keyboard));
        Ok(())
    }

    async fn notify_permission(
        &self,
        prompt_text: &str,
        _options: &[String],
    ) -> Result<(), ChatSendError> {
        self.permission_prompts
            .lock()
            .unwrap()
            .push(prompt_text.to_string());
        Ok(())
    }

    async fn send_typing(&self) -> Result<(), ChatSendError> {
        Ok(())
    }
}

fn fast_config() -> TurnRuntimeConfig {
    TurnRuntimeConfig {
        min_update_interval: Duration::from_millis(10),
        min_update_delta_chars: 1,
        poll_initial_interval: Duration::from_millis(20),
        poll_max_interval: Duration::from_millis(40),
        poll_min_stable: Duration::from_millis(200),
        ..TurnRuntimeConfig::default()
    }
}

fn key() -> TurnKey {
    TurnKey {
        chat_id: "c1".to_string(),
        session_id: "s1".to_string(),
    }
}

fn completed_snapshot(text: &str, steps: Vec<CompletedStep>) -> MessageSnapshot {
    MessageSnapshot {
        id: "m1".to_string(),
        text_parts: vec![text.to_string()],
        completed_unix_ms: Some(1_700_000_000_000),
        steps,
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting: {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn integration_operator_message_runs_a_full_turn_to_a_terminal_render() {
    let (backend, events) =
        ScriptedBackend::new(vec![completed_snapshot("The build failed on lint.", vec![])]);
    let surface = Arc::new(RecordingSurface::default());
    let orchestrator =
        TurnOrchestrator::new(backend.clone(), surface.clone(), fast_config());

    events.send(Ok(BackendEvent::SessionIdle)).unwrap();

    let routing = orchestrator.handle_message(&key(), "why did CI fail?").await;

    assert_eq!(routing, InputRouting::TurnFinished(TurnOutcome::Completed));
    assert_eq!(backend.submitted_prompts(), vec!["why did CI fail?"]);
    let renders = surface.renders();
    let (final_text, final_keyboard) = renders.last().expect("terminal render");
    assert_eq!(*final_keyboard, KeyboardKind::Hidden);
    assert!(final_text.contains("The build failed on lint."));
    assert!(final_text.contains("done | tokens"));
}

#[tokio::test]
async fn integration_overlapping_channels_credit_each_step_once() {
    let step_one = StepUsage {
        input_tokens: 100,
        output_tokens: 10,
        cost_usd: 0.001,
    };
    let step_two = StepUsage {
        input_tokens: 50,
        output_tokens: 5,
        cost_usd: 0.0005,
    };
    let (backend, events) = ScriptedBackend::new(vec![completed_snapshot(
        "answer",
        vec![
            CompletedStep {
                step_id: "step-1".to_string(),
                usage: step_one,
                completed_unix_ms: 1,
            },
            CompletedStep {
                step_id: "step-2".to_string(),
                usage: step_two,
                completed_unix_ms: 2,
            },
        ],
    )]);
    let surface = Arc::new(RecordingSurface::default());
    let orchestrator =
        TurnOrchestrator::new(backend.clone(), surface.clone(), fast_config());

    // The push channel reports step-1 too; the snapshot restates it.
    events
        .send(Ok(BackendEvent::StepFinish {
            step_id: "step-1".to_string(),
            usage: step_one,
        }))
        .unwrap();
    events.send(Ok(BackendEvent::SessionIdle)).unwrap();

    let routing = orchestrator.handle_message(&key(), "go").await;

    assert_eq!(routing, InputRouting::TurnFinished(TurnOutcome::Completed));
    let renders = surface.renders();
    let (final_text, _) = renders.last().expect("terminal render");
    assert!(
        final_text.contains("tokens 150/15"),
        "expected once-per-step totals in: {final_text}"
    );
}

#[tokio::test]
async fn integration_permission_handshake_and_nudge_delivery() {
    let (backend, events) =
        ScriptedBackend::new(vec![completed_snapshot("deployed", vec![])]);
    let surface = Arc::new(RecordingSurface::default());
    let orchestrator = Arc::new(TurnOrchestrator::new(
        backend.clone(),
        surface.clone(),
        fast_config(),
    ));

    events
        .send(Ok(BackendEvent::PermissionAsk {
            request: PermissionRequest {
                id: "req-1".to_string(),
                tool_name: "bash".to_string(),
                description: "run the deploy script".to_string(),
                capability: CapabilityClass::Mutating,
            },
        }))
        .unwrap();

    let driver = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_message(&key(), "deploy it").await })
    };

    wait_for("permission prompt", || {
        !surface.permission_prompts().is_empty()
    })
    .await;

    // A message typed while the turn is suspended becomes a nudge.
    let routing = orchestrator.handle_message(&key(), "use the staging env").await;
    assert_eq!(routing, InputRouting::QueuedForActiveTurn);

    assert!(orchestrator.resolve_permission(&key(), PermissionDecision::ApproveOnce));
    events.send(Ok(BackendEvent::SessionIdle)).unwrap();

    let routing = driver.await.expect("driver task");
    assert_eq!(routing, InputRouting::TurnFinished(TurnOutcome::Completed));
    assert_eq!(
        backend.permission_acks(),
        vec![("req-1".to_string(), PermissionDecision::ApproveOnce)]
    );
    assert_eq!(
        backend.submitted_prompts(),
        vec!["deploy it", "use the staging env"]
    );
    // A late duplicate tap finds no waiting turn.
    assert!(!orchestrator.resolve_permission(&key(), PermissionDecision::Reject));
}

#[tokio::test]
async fn integration_stop_request_aborts_and_frees_the_session_for_a_new_turn() {
    let (backend, events) = ScriptedBackend::new(vec![MessageSnapshot {
        id: "m1".to_string(),
        text_parts: vec!["working on it".to_string()],
        completed_unix_ms: None,
        steps: Vec::new(),
    }]);
    let surface = Arc::new(RecordingSurface::default());
    let orchestrator = Arc::new(TurnOrchestrator::new(
        backend.clone(),
        surface.clone(),
        fast_config(),
    ));

    let driver = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_message(&key(), "long job").await })
    };

    wait_for("first render", || !surface.renders().is_empty()).await;
    assert!(orchestrator.request_stop(&key()));

    let routing = driver.await.expect("driver task");
    assert_eq!(routing, InputRouting::TurnFinished(TurnOutcome::Stopped));
    assert_eq!(backend.aborted_sessions(), vec!["s1"]);
    let renders = surface.renders();
    let (final_text, _) = renders.last().expect("terminal render");
    assert!(final_text.contains("stopped"));
    // The registry released the key; stopping again reports nothing to stop.
    assert!(!orchestrator.request_stop(&key()));
    drop(events);
}
