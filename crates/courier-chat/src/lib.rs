//! Chat-surface-facing pieces of the Courier turn relay: render formatting,
//! size-bounded chunking, outward-update throttling, and the collaborator
//! contract implemented by a concrete chat adapter.

mod chunker;
mod formatter;
mod surface_contract;
mod update_gate;

pub use chunker::split_into_chunks;
pub use formatter::{
    render_frame, render_frame_plain, BreadcrumbEntry, FrameOutcome, FramePhase, FrameTask,
    FrameUsage, RenderFrame,
};
pub use surface_contract::{ChatSendError, ChatSurface, KeyboardKind};
pub use update_gate::{GateDecision, UpdateGate, UpdateGateConfig};
