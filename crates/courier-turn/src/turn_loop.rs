//! The merge loop: drives one turn from submission to its terminal render.

use std::sync::Arc;
use std::time::Instant;

use courier_backend::{
    AgentBackend, BackendError, BackendEvent, EventStream, PermissionDecision, PromptHandle,
};
use courier_chat::{
    render_frame, render_frame_plain, split_into_chunks, ChatSendError, ChatSurface, GateDecision,
    KeyboardKind, UpdateGate, UpdateGateConfig,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::cancel::TurnCancellationToken;
use crate::nudge_queue::NudgeQueueStore;
use crate::orchestrator::TurnRuntimeConfig;
use crate::permission::{
    permission_option_labels, permission_prompt_text, DecisionSlot, PermissionPolicy, PolicyVerdict,
};
use crate::poller::{spawn_poller, PollSignal, PollerConfig};
use crate::turn_state::{TurnOutcome, TurnState};

type SubmitTask = tokio::task::JoinHandle<Result<PromptHandle, BackendError>>;

/// Everything one turn needs, bundled so the loop body stays readable.
pub(crate) struct TurnContext {
    pub backend: Arc<dyn AgentBackend>,
    pub surface: Arc<dyn ChatSurface>,
    pub policy: Arc<dyn PermissionPolicy>,
    pub nudges: NudgeQueueStore,
    pub session_id: String,
    pub config: TurnRuntimeConfig,
    pub cancel: TurnCancellationToken,
    pub decisions: DecisionSlot,
}

/// Runs one turn to a terminal state.
///
/// Input sources: the push event stream, the pull poller, and the prompt
/// submission itself. Either channel may die mid-turn; the loop degrades to
/// the surviving one and still terminates. All exits funnel through the
/// single teardown after the loop, so the terminal render happens exactly
/// once no matter which branch ended the turn.
pub(crate) async fn drive_turn(ctx: TurnContext, prompt: String) -> TurnOutcome {
    let mut state = TurnState::new();
    let mut gate = UpdateGate::new(UpdateGateConfig {
        min_interval: ctx.config.min_update_interval,
        min_delta_chars: ctx.config.min_update_delta_chars,
    });

    spawn_typing_task(
        ctx.surface.clone(),
        ctx.cancel.clone(),
        ctx.config.typing_interval,
    );

    let mut events: Option<EventStream> = match ctx.backend.subscribe(&ctx.session_id).await {
        Ok(stream) => Some(stream),
        Err(error) => {
            tracing::warn!(
                session_id = ctx.session_id.as_str(),
                error = %error,
                "event subscription failed, relying on the pull channel"
            );
            None
        }
    };

    // Spawned so the backend call runs to completion even when the loop
    // exits or suspends before it resolves.
    let mut submit: Option<SubmitTask> = Some(tokio::spawn({
        let backend = ctx.backend.clone();
        let session_id = ctx.session_id.clone();
        async move { backend.submit_prompt(&session_id, &prompt).await }
    }));
    let mut prompt_handle: Option<PromptHandle> = None;
    let mut poll_rx: Option<mpsc::Receiver<PollSignal>> = None;

    let deadline = ctx
        .config
        .turn_timeout
        .map(|timeout| tokio::time::Instant::now() + timeout);
    let mut flush_timer = tokio::time::interval(ctx.config.min_update_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let outcome = loop {
        // Every input source is gone: settle on what was observed.
        if events.is_none() && poll_rx.is_none() && submit.is_none() {
            if state.transcript.is_empty() {
                state.note_error("the agent went away before producing a response");
                break TurnOutcome::Failed;
            }
            break TurnOutcome::Completed;
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break TurnOutcome::Stopped,

            // Deadline expiry is a cancellation trigger, not a failure: it
            // takes the same abort-and-stop path as the stop button.
            _ = sleep_until_deadline(deadline) => {
                tracing::warn!(
                    session_id = ctx.session_id.as_str(),
                    "turn exceeded its time limit, stopping"
                );
                break TurnOutcome::Stopped;
            }

            result = resolve_submit(&mut submit) => {
                submit = None;
                match result {
                    Ok(handle) => {
                        poll_rx = Some(spawn_poller(
                            ctx.backend.clone(),
                            handle.session_id.clone(),
                            handle.message_id.clone(),
                            PollerConfig {
                                initial_interval: ctx.config.poll_initial_interval,
                                max_interval: ctx.config.poll_max_interval,
                                stable_cycles: ctx.config.poll_stable_cycles,
                                min_stable: ctx.config.poll_min_stable,
                            },
                            ctx.cancel.clone(),
                        ));
                        prompt_handle = Some(handle);
                    }
                    Err(error) => {
                        tracing::warn!(
                            session_id = ctx.session_id.as_str(),
                            error = %error,
                            "prompt submission failed"
                        );
                        state.note_error(&format!("could not reach the agent: {error}"));
                        break TurnOutcome::Failed;
                    }
                }
            }

            event = next_event(&mut events) => match event {
                Some(Ok(BackendEvent::PermissionAsk { request })) => {
                    match ctx.policy.evaluate(&request) {
                        PolicyVerdict::AutoApprove => {
                            tracing::debug!(
                                tool_name = request.tool_name.as_str(),
                                "auto-approving read-only tool request"
                            );
                            if let Err(error) = ctx
                                .backend
                                .respond_permission(
                                    &ctx.session_id,
                                    &request.id,
                                    PermissionDecision::ApproveOnce,
                                )
                                .await
                            {
                                tracing::warn!(error = %error, "auto-approval delivery failed");
                            }
                        }
                        PolicyVerdict::Ask => {
                            let decision_rx = ctx.decisions.arm();
                            state.begin_permission(request.clone());
                            let prompt_text = permission_prompt_text(&request);
                            if let Err(error) = ctx
                                .surface
                                .notify_permission(&prompt_text, &permission_option_labels())
                                .await
                            {
                                tracing::warn!(error = %error, "permission notification failed");
                            }
                            flush_render(&ctx, &mut gate, &state, None, true).await;

                            let decision = tokio::select! {
                                _ = ctx.cancel.cancelled() => break TurnOutcome::Stopped,
                                received = decision_rx => match received {
                                    Ok(decision) => decision,
                                    Err(_) => break TurnOutcome::Stopped,
                                },
                            };
                            if let Err(error) = ctx
                                .backend
                                .respond_permission(&ctx.session_id, &request.id, decision)
                                .await
                            {
                                tracing::warn!(error = %error, "permission decision delivery failed");
                                state.note_error("the agent did not accept the approval decision");
                                break TurnOutcome::Failed;
                            }
                            state.resolve_permission();
                            flush_render(&ctx, &mut gate, &state, None, true).await;
                            forward_nudges(&ctx).await;
                        }
                    }
                }
                Some(Ok(BackendEvent::SessionIdle)) => {
                    // Catch trailing text and step credits the stream may
                    // have raced past.
                    if let Some(handle) = &prompt_handle {
                        if let Ok(snapshot) = ctx
                            .backend
                            .get_message(&handle.session_id, &handle.message_id)
                            .await
                        {
                            state.merge_transcript(&snapshot.combined_text());
                            for step in &snapshot.steps {
                                state.credit_step(&step.step_id, step.usage);
                            }
                        }
                    }
                    break TurnOutcome::Completed;
                }
                Some(Ok(event)) => {
                    if apply_event(&mut state, event) {
                        flush_render(&ctx, &mut gate, &state, None, true).await;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        session_id = ctx.session_id.as_str(),
                        error = %error,
                        "event stream lost, degrading to the pull channel"
                    );
                    events = None;
                }
                None => events = None,
            },

            signal = next_poll(&mut poll_rx) => match signal {
                Some(PollSignal::Observation(snapshot)) => {
                    state.merge_transcript(&snapshot.combined_text());
                    for step in &snapshot.steps {
                        state.credit_step(&step.step_id, step.usage);
                    }
                }
                Some(PollSignal::Settled) => break TurnOutcome::Completed,
                None => poll_rx = None,
            },

            _ = flush_timer.tick() => {
                flush_render(&ctx, &mut gate, &state, None, false).await;
            }
        }
    };

    // Single teardown path for every way the loop can end.
    ctx.cancel.cancel();
    if outcome == TurnOutcome::Stopped {
        if let Err(error) = ctx.backend.abort(&ctx.session_id).await {
            tracing::warn!(
                session_id = ctx.session_id.as_str(),
                error = %error,
                "backend abort request failed"
            );
        }
        state.mark_aborted();
    }
    ctx.decisions.disarm();
    if let Some(remaining) = gate.pause_remaining(Instant::now()) {
        tokio::time::sleep(remaining).await;
    }
    flush_render(&ctx, &mut gate, &state, Some(outcome), true).await;
    outcome
}

/// Applies a non-suspending event to turn state. Returns true when the
/// visible phase changed and the render should not wait for the next tick.
fn apply_event(state: &mut TurnState, event: BackendEvent) -> bool {
    match event {
        BackendEvent::ReasoningDelta { .. } => state.note_reasoning(),
        BackendEvent::TextSnapshot { text, .. } => {
            state.merge_transcript(&text);
            false
        }
        BackendEvent::ToolState {
            name,
            title,
            status,
            ..
        } => state.apply_tool_state(&name, title.as_deref(), status),
        BackendEvent::StepFinish { step_id, usage } => {
            state.credit_step(&step_id, usage);
            false
        }
        BackendEvent::TaskListSnapshot { tasks } => {
            state.update_tasks(tasks);
            false
        }
        BackendEvent::FileTouched { path } => {
            tracing::debug!(path = path.as_str(), "agent touched a file");
            false
        }
        BackendEvent::PermissionAsk { .. } | BackendEvent::SessionIdle => false,
    }
}

/// Renders the current state through the gate and ships it in fence-safe
/// chunks. Transport trouble updates the gate's latches and leaves the
/// state for the next flush; nothing here fails the turn.
async fn flush_render(
    ctx: &TurnContext,
    gate: &mut UpdateGate,
    state: &TurnState,
    outcome: Option<TurnOutcome>,
    forced: bool,
) {
    let frame = state.to_frame(outcome);
    let keyboard = if outcome.is_some() {
        KeyboardKind::Hidden
    } else if state.pending_permission.is_some() {
        KeyboardKind::Permission
    } else {
        KeyboardKind::Stop
    };
    let mut plain = gate.plain_only();
    loop {
        let text = if plain {
            render_frame_plain(&frame)
        } else {
            render_frame(&frame)
        };
        if gate.decide(Instant::now(), &text, keyboard, forced) == GateDecision::Suppress {
            return;
        }
        match send_chunks(ctx.surface.as_ref(), &text, keyboard, ctx.config.max_chunk_chars).await {
            Ok(()) => {
                gate.note_sent(Instant::now(), &text, keyboard);
                return;
            }
            Err(ChatSendError::RateLimited { retry_after_secs }) => {
                gate.note_rate_limited(Instant::now(), retry_after_secs);
                return;
            }
            Err(ChatSendError::MarkupRejected) if !plain => {
                gate.note_markup_rejected();
                plain = true;
            }
            Err(ChatSendError::MarkupRejected) => {
                tracing::warn!("chat surface rejected a plain render, dropping this flush");
                return;
            }
            Err(ChatSendError::Transport(detail)) => {
                tracing::warn!(
                    detail = detail.as_str(),
                    "chat render failed, state kept for the next flush"
                );
                return;
            }
        }
    }
}

async fn send_chunks(
    surface: &dyn ChatSurface,
    text: &str,
    keyboard: KeyboardKind,
    max_chunk_chars: usize,
) -> Result<(), ChatSendError> {
    for chunk in split_into_chunks(text, max_chunk_chars) {
        surface.render(&chunk, keyboard).await?;
    }
    Ok(())
}

/// Drains queued mid-turn operator messages into the session as one
/// follow-up prompt.
async fn forward_nudges(ctx: &TurnContext) {
    let queued = ctx.nudges.take_all(&ctx.session_id);
    if queued.is_empty() {
        return;
    }
    let combined = queued.join("\n");
    if let Err(error) = ctx.backend.submit_prompt(&ctx.session_id, &combined).await {
        tracing::warn!(
            session_id = ctx.session_id.as_str(),
            error = %error,
            "forwarding queued messages failed"
        );
    }
}

fn spawn_typing_task(
    surface: Arc<dyn ChatSurface>,
    cancel: TurnCancellationToken,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = surface.send_typing().await {
                        tracing::debug!(error = %error, "typing indicator send failed");
                    }
                }
            }
        }
    });
}

async fn resolve_submit(submit: &mut Option<SubmitTask>) -> Result<PromptHandle, BackendError> {
    match submit.as_mut() {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(join_error) => Err(BackendError::Unreachable(format!(
                "prompt submission task failed: {join_error}"
            ))),
        },
        None => std::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<EventStream>,
) -> Option<Result<BackendEvent, BackendError>> {
    match events.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_poll(poll_rx: &mut Option<mpsc::Receiver<PollSignal>>) -> Option<PollSignal> {
    match poll_rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
