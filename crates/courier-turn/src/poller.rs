//! Pull channel: periodic message-snapshot polling with backoff.

use std::sync::Arc;
use std::time::Duration;

use courier_backend::{AgentBackend, MessageSnapshot};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cancel::TurnCancellationToken;

/// Tunables for the snapshot poller.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollerConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Consecutive unchanged polls before the poller may settle the turn.
    pub stable_cycles: u32,
    /// Minimum quiet time since the last observed change before settling.
    pub min_stable: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_millis(5_000),
            stable_cycles: 3,
            min_stable: Duration::from_millis(10_000),
        }
    }
}

/// What the poller tells the merge loop.
#[derive(Debug)]
pub(crate) enum PollSignal {
    /// A fresh snapshot to merge; carries no termination meaning.
    Observation(MessageSnapshot),
    /// The message completed, or went quiet long enough to count as done.
    Settled,
}

/// Spawns the polling task for one response message.
///
/// The poller is an input source only: it reports snapshots and a settle
/// signal over the channel and never touches turn state itself. It keeps
/// polling through transient backend errors; only completion, sustained
/// stability, cancellation, or the merge loop going away stop it.
pub(crate) fn spawn_poller(
    backend: Arc<dyn AgentBackend>,
    session_id: String,
    message_id: String,
    config: PollerConfig,
    cancel: TurnCancellationToken,
) -> mpsc::Receiver<PollSignal> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut interval = config.initial_interval;
        let mut fingerprint: Option<String> = None;
        let mut unchanged_polls = 0_u32;
        let mut last_change = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            interval = (interval * 2).min(config.max_interval);
            let snapshot = match backend.get_message(&session_id, &message_id).await {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    tracing::warn!(
                        session_id = session_id.as_str(),
                        message_id = message_id.as_str(),
                        error = %error,
                        "message poll failed, will retry"
                    );
                    continue;
                }
            };
            let completed = snapshot.is_completed();
            let current = poll_fingerprint(&snapshot);
            if fingerprint.as_deref() == Some(current.as_str()) {
                unchanged_polls += 1;
            } else {
                fingerprint = Some(current);
                unchanged_polls = 0;
                last_change = Instant::now();
            }
            if tx.send(PollSignal::Observation(snapshot)).await.is_err() {
                break;
            }
            if completed {
                let _ = tx.send(PollSignal::Settled).await;
                break;
            }
            if unchanged_polls >= config.stable_cycles && last_change.elapsed() >= config.min_stable
            {
                tracing::debug!(
                    session_id = session_id.as_str(),
                    message_id = message_id.as_str(),
                    unchanged_polls,
                    "snapshot stable, settling turn from pull channel"
                );
                let _ = tx.send(PollSignal::Settled).await;
                break;
            }
        }
    });
    rx
}

fn poll_fingerprint(snapshot: &MessageSnapshot) -> String {
    format!(
        "{}|{}|{}",
        snapshot.combined_text(),
        snapshot.steps.len(),
        snapshot.is_completed()
    )
}
