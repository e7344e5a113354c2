//! Collaborator contract for the chat adapter that owns the visible message.

use async_trait::async_trait;
use thiserror::Error;

/// Control/keyboard state that should accompany the visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardKind {
    Hidden,
    Stop,
    Permission,
}

/// Enumerates transport failures the turn runtime reacts to.
#[derive(Debug, Error)]
pub enum ChatSendError {
    #[error("chat surface rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("chat surface rejected formatted markup")]
    MarkupRejected,
    #[error("chat surface transport error: {0}")]
    Transport(String),
}

/// Trait contract for the chat adapter.
///
/// `render` is an idempotent "set the current turn's visible message";
/// callers guarantee the stream of calls is already throttled and
/// deduplicated, so implementations may edit one platform message in place.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    async fn render(&self, text: &str, keyboard: KeyboardKind) -> Result<(), ChatSendError>;

    /// Surfaces a pending tool-approval prompt with its decision options.
    async fn notify_permission(
        &self,
        prompt_text: &str,
        options: &[String],
    ) -> Result<(), ChatSendError>;

    /// Keeps the platform "typing" indicator alive while a turn is working.
    async fn send_typing(&self) -> Result<(), ChatSendError>;
}
