//! Wire types and the async trait boundary for the agent backend.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ordered push feed of backend events, already filtered to one session.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send>>;

/// Enumerates failures surfaced by backend calls and the event feed.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("agent backend unreachable: {0}")]
    Unreachable(String),
    #[error("agent backend protocol error: {0}")]
    Protocol(String),
    #[error("agent backend returned http status {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("agent backend event stream closed")]
    StreamClosed,
}

/// Lifecycle states a tool invocation moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    /// Returns true for states that end the invocation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Token and cost accounting for one completed backend step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// One entry of the backend-reported task list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskItem {
    pub label: String,
    pub done: bool,
}

/// Broad capability classification attached to a tool-approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    ReadOnly,
    Mutating,
    Network,
    #[serde(other)]
    Unknown,
}

/// A tool-approval request embedded in the event feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub tool_name: String,
    pub description: String,
    pub capability: CapabilityClass,
}

/// Human decision forwarded back to the backend for a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    ApproveOnce,
    ApproveAlways,
    Reject,
}

impl PermissionDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApproveOnce => "approve_once",
            Self::ApproveAlways => "approve_always",
            Self::Reject => "reject",
        }
    }
}

/// Events emitted on the session-scoped push feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    ReasoningDelta {
        text: String,
    },
    TextSnapshot {
        message_id: String,
        text: String,
    },
    ToolState {
        call_id: String,
        name: String,
        #[serde(default)]
        title: Option<String>,
        status: ToolStatus,
    },
    StepFinish {
        step_id: String,
        usage: StepUsage,
    },
    TaskListSnapshot {
        tasks: Vec<TaskItem>,
    },
    FileTouched {
        path: String,
    },
    PermissionAsk {
        request: PermissionRequest,
    },
    SessionIdle,
}

/// One step recorded on a polled message snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step_id: String,
    pub usage: StepUsage,
    pub completed_unix_ms: u64,
}

/// Point-query view of a message, used by the pull channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub id: String,
    #[serde(default)]
    pub text_parts: Vec<String>,
    #[serde(default)]
    pub completed_unix_ms: Option<u64>,
    #[serde(default)]
    pub steps: Vec<CompletedStep>,
}

impl MessageSnapshot {
    /// Joins the text parts into the snapshot's full visible text.
    pub fn combined_text(&self) -> String {
        self.text_parts
            .iter()
            .map(String::as_str)
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Returns true once the backend reports the message settled.
    pub fn is_completed(&self) -> bool {
        self.completed_unix_ms.is_some()
    }
}

/// Handle returned by prompt submission; identifies the response message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptHandle {
    pub session_id: String,
    pub message_id: String,
}

/// Trait contract for the opaque agent backend.
///
/// Implementations must be safe to share across the turn's listener tasks;
/// every call is session-scoped and side-effect free on the relay's own
/// state.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Submits a prompt; may be slow, is not required to stream.
    async fn submit_prompt(&self, session_id: &str, text: &str)
        -> Result<PromptHandle, BackendError>;

    /// Subscribes to the ordered event feed for one session.
    async fn subscribe(&self, session_id: &str) -> Result<EventStream, BackendError>;

    /// Fetches the current snapshot of a message by id.
    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<MessageSnapshot, BackendError>;

    /// Acknowledges a tool-approval request with a decision.
    async fn respond_permission(
        &self,
        session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), BackendError>;

    /// Asks the backend to stop the in-flight turn for the session.
    async fn abort(&self, session_id: &str) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::{BackendEvent, CapabilityClass, MessageSnapshot, StepUsage, ToolStatus};

    #[test]
    fn unit_backend_event_round_trips_through_tagged_json() {
        let event = BackendEvent::StepFinish {
            step_id: "step-1".to_string(),
            usage: StepUsage {
                input_tokens: 120,
                output_tokens: 48,
                cost_usd: 0.0042,
            },
        };
        let raw = serde_json::to_string(&event).expect("serialize");
        assert!(raw.contains("\"type\":\"step_finish\""));
        let decoded: BackendEvent = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(decoded, event);
    }

    #[test]
    fn unit_unknown_capability_decodes_to_unknown_variant() {
        let decoded: CapabilityClass =
            serde_json::from_str("\"something_new\"").expect("deserialize");
        assert_eq!(decoded, CapabilityClass::Unknown);
    }

    #[test]
    fn unit_tool_status_terminal_classification() {
        assert!(ToolStatus::Completed.is_terminal());
        assert!(ToolStatus::Error.is_terminal());
        assert!(!ToolStatus::Queued.is_terminal());
        assert!(!ToolStatus::Running.is_terminal());
    }

    #[test]
    fn unit_message_snapshot_combined_text_skips_blank_parts() {
        let snapshot = MessageSnapshot {
            id: "m1".to_string(),
            text_parts: vec![
                "first".to_string(),
                "   ".to_string(),
                "second".to_string(),
            ],
            completed_unix_ms: None,
            steps: Vec::new(),
        };
        assert_eq!(snapshot.combined_text(), "first\n\nsecond");
        assert!(!snapshot.is_completed());
    }
}
