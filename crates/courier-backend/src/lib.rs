//! Agent backend contract and HTTP/SSE client for the Courier turn relay.
//!
//! The backend is treated as an opaque event/RPC source: a session-scoped
//! prompt submission call, an ordered push event feed, a point-query message
//! snapshot used by the status poller, a tool-approval acknowledgement call,
//! and a turn-abort call. `HttpAgentBackend` is the concrete client; the
//! turn runtime only ever sees the `AgentBackend` trait.

mod backend_contract;
mod http_backend;

pub use backend_contract::{
    AgentBackend, BackendError, BackendEvent, CapabilityClass, CompletedStep, EventStream,
    MessageSnapshot, PermissionDecision, PermissionRequest, PromptHandle, StepUsage, TaskItem,
    ToolStatus,
};
pub use http_backend::HttpAgentBackend;
