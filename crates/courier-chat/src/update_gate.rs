//! Throttles outward renders and deduplicates against the last sent state.

use std::time::{Duration, Instant};

use crate::surface_contract::KeyboardKind;

/// Tunables for the outward-update throttle.
#[derive(Debug, Clone, Copy)]
pub struct UpdateGateConfig {
    pub min_interval: Duration,
    pub min_delta_chars: usize,
}

impl Default for UpdateGateConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1_500),
            min_delta_chars: 24,
        }
    }
}

/// Whether a candidate render should go out now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Send,
    Suppress,
}

/// Tracks what was last sent to the chat surface and decides whether a new
/// render is worth a network call.
///
/// Also owns the two per-turn transport latches: a soft pause after a
/// rate-limit response and a sticky fallback to plain rendering after the
/// surface rejects formatted markup.
#[derive(Debug)]
pub struct UpdateGate {
    config: UpdateGateConfig,
    last_sent_at: Option<Instant>,
    last_rendered_text: String,
    last_keyboard: Option<KeyboardKind>,
    paused_until: Option<Instant>,
    plain_only: bool,
}

impl UpdateGate {
    pub fn new(config: UpdateGateConfig) -> Self {
        Self {
            config,
            last_sent_at: None,
            last_rendered_text: String::new(),
            last_keyboard: None,
            paused_until: None,
            plain_only: false,
        }
    }

    /// True once the surface has rejected markup this turn.
    pub fn plain_only(&self) -> bool {
        self.plain_only
    }

    /// Decides whether `rendered` should be sent at `now`.
    ///
    /// A rate-limit pause suppresses everything, forced or not; otherwise a
    /// forced render goes out unless it is byte-identical to the last send.
    /// Unforced renders additionally need the minimum interval to have
    /// elapsed and either enough character delta or a keyboard change.
    pub fn decide(
        &self,
        now: Instant,
        rendered: &str,
        keyboard: KeyboardKind,
        forced: bool,
    ) -> GateDecision {
        if let Some(paused_until) = self.paused_until {
            if now < paused_until {
                return GateDecision::Suppress;
            }
        }
        if rendered == self.last_rendered_text && self.last_keyboard == Some(keyboard) {
            return GateDecision::Suppress;
        }
        if forced {
            return GateDecision::Send;
        }
        let Some(last_sent_at) = self.last_sent_at else {
            return GateDecision::Send;
        };
        if now.duration_since(last_sent_at) < self.config.min_interval {
            return GateDecision::Suppress;
        }
        let delta = self
            .last_rendered_text
            .chars()
            .count()
            .abs_diff(rendered.chars().count());
        if delta >= self.config.min_delta_chars || self.last_keyboard != Some(keyboard) {
            GateDecision::Send
        } else {
            GateDecision::Suppress
        }
    }

    /// Time left on the rate-limit pause, if one is in effect at `now`.
    pub fn pause_remaining(&self, now: Instant) -> Option<Duration> {
        self.paused_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Records a successful send as the new dedup fingerprint.
    pub fn note_sent(&mut self, now: Instant, rendered: &str, keyboard: KeyboardKind) {
        self.last_sent_at = Some(now);
        self.last_rendered_text = rendered.to_string();
        self.last_keyboard = Some(keyboard);
        self.paused_until = None;
    }

    /// Applies the transport's "retry after" as a soft pause; not a failure.
    pub fn note_rate_limited(&mut self, now: Instant, retry_after_secs: u64) {
        let paused_until = now + Duration::from_secs(retry_after_secs);
        tracing::debug!(retry_after_secs, "chat surface rate limited, pausing renders");
        self.paused_until = Some(paused_until);
    }

    /// Latches plain rendering for the remainder of the turn.
    pub fn note_markup_rejected(&mut self) {
        if !self.plain_only {
            tracing::debug!("chat surface rejected markup, falling back to plain rendering");
        }
        self.plain_only = true;
    }
}
