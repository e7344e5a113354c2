//! Mutable state of one in-flight turn, exclusively owned by its merge loop.

use std::collections::HashSet;

use courier_backend::{PermissionRequest, StepUsage, TaskItem, ToolStatus};
use courier_chat::{BreadcrumbEntry, FrameOutcome, FramePhase, FrameTask, FrameUsage, RenderFrame};

/// Phase of the in-flight turn. Moves forward monotonically except that
/// tool-running and responding may alternate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Thinking,
    Reasoning,
    ToolRunning,
    Responding,
    AwaitingPermission,
}

/// Terminal state of a finished turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Stopped,
    Failed,
}

impl TurnOutcome {
    pub(crate) fn as_frame_outcome(self) -> FrameOutcome {
        match self {
            Self::Completed => FrameOutcome::Done,
            Self::Stopped => FrameOutcome::Stopped,
            Self::Failed => FrameOutcome::Failed,
        }
    }
}

/// One collapsed entry of the tool breadcrumb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRecord {
    pub name: String,
    pub repeats: usize,
    pub failed: bool,
}

/// Monotonically increasing token/cost counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// All mutable state of one turn. Mutated only from within the merge
/// loop's single logical sequence; the poller and the event-stream reader
/// are input sources, never concurrent writers.
#[derive(Debug)]
pub struct TurnState {
    pub phase: TurnPhase,
    pub transcript: String,
    pub tool_history: Vec<ToolRecord>,
    pub current_tool: Option<String>,
    pub pending_permission: Option<PermissionRequest>,
    pub tasks: Vec<TaskItem>,
    usage: UsageTotals,
    credited_steps: HashSet<String>,
    aborted: bool,
}

impl Default for TurnState {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnState {
    pub fn new() -> Self {
        Self {
            phase: TurnPhase::Thinking,
            transcript: String::new(),
            tool_history: Vec::new(),
            current_tool: None,
            pending_permission: None,
            tasks: Vec::new(),
            usage: UsageTotals::default(),
            credited_steps: HashSet::new(),
            aborted: false,
        }
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    /// Merges an observed text fragment into the transcript.
    ///
    /// If one of the two texts is a prefix or suffix of the other the
    /// longer one wins, so overlapping or restated snapshots from the two
    /// channels never duplicate content and visible output never shrinks.
    /// Unrelated text is appended with a blank-line boundary. Returns true
    /// when the transcript changed.
    pub fn merge_transcript(&mut self, incoming: &str) -> bool {
        let incoming = incoming.trim();
        if incoming.is_empty() {
            return false;
        }
        if self.transcript.is_empty() {
            self.transcript = incoming.to_string();
        } else if incoming == self.transcript
            || self.transcript.starts_with(incoming)
            || self.transcript.ends_with(incoming)
        {
            return false;
        } else if incoming.starts_with(self.transcript.as_str())
            || incoming.ends_with(self.transcript.as_str())
        {
            self.transcript = incoming.to_string();
        } else {
            self.transcript.push_str("\n\n");
            self.transcript.push_str(incoming);
        }
        if self.phase != TurnPhase::AwaitingPermission {
            self.phase = TurnPhase::Responding;
        }
        true
    }

    /// Appends an operator-visible error line to the transcript.
    pub fn note_error(&mut self, message: &str) {
        let line = format!("⚠️ {message}");
        if self.transcript.is_empty() {
            self.transcript = line;
        } else {
            self.transcript.push_str("\n\n");
            self.transcript.push_str(&line);
        }
    }

    /// Marks the turn as having produced reasoning output.
    pub fn note_reasoning(&mut self) -> bool {
        if self.phase == TurnPhase::Thinking {
            self.phase = TurnPhase::Reasoning;
            return true;
        }
        false
    }

    /// Applies a tool-state transition. Returns true when the phase moved.
    ///
    /// A running tool becomes the current tool; a terminal status folds it
    /// into the breadcrumb, collapsing consecutive identical labels into a
    /// repeat count. The backend's human-readable `title` wins over the
    /// raw tool name when present.
    pub fn apply_tool_state(&mut self, name: &str, title: Option<&str>, status: ToolStatus) -> bool {
        let label = title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or(name);
        if status.is_terminal() {
            let failed = status == ToolStatus::Error;
            match self.tool_history.last_mut() {
                Some(last) if last.name == label => {
                    last.repeats += 1;
                    last.failed |= failed;
                }
                _ => self.tool_history.push(ToolRecord {
                    name: label.to_string(),
                    repeats: 1,
                    failed,
                }),
            }
            self.current_tool = None;
            return false;
        }
        if status == ToolStatus::Running {
            self.current_tool = Some(label.to_string());
            if self.phase != TurnPhase::ToolRunning {
                self.phase = TurnPhase::ToolRunning;
                return true;
            }
        }
        false
    }

    /// Credits token/cost for a step exactly once, keyed by step id.
    ///
    /// Either channel may report the same step, in any order, any number of
    /// times; only the first report counts.
    pub fn credit_step(&mut self, step_id: &str, usage: StepUsage) -> bool {
        if !self.credited_steps.insert(step_id.to_string()) {
            return false;
        }
        self.usage.input_tokens += usage.input_tokens;
        self.usage.output_tokens += usage.output_tokens;
        self.usage.cost_usd += usage.cost_usd;
        true
    }

    pub fn update_tasks(&mut self, tasks: Vec<TaskItem>) {
        self.tasks = tasks;
    }

    /// Suspends the turn on a pending tool-approval request.
    pub fn begin_permission(&mut self, request: PermissionRequest) {
        self.pending_permission = Some(request);
        self.phase = TurnPhase::AwaitingPermission;
    }

    /// Clears the pending request after a decision; the turn resumes in
    /// tool-running.
    pub fn resolve_permission(&mut self) {
        self.pending_permission = None;
        self.phase = TurnPhase::ToolRunning;
    }

    /// Write-once abort flag. Clears the pending permission and current
    /// tool so neither can outlive the turn.
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
        self.pending_permission = None;
        self.current_tool = None;
    }

    /// Projects the state into the formatter's read-only frame.
    pub fn to_frame(&self, outcome: Option<TurnOutcome>) -> RenderFrame {
        RenderFrame {
            phase: match self.phase {
                TurnPhase::Thinking => FramePhase::Thinking,
                TurnPhase::Reasoning => FramePhase::Reasoning,
                TurnPhase::ToolRunning => FramePhase::ToolRunning,
                TurnPhase::Responding => FramePhase::Responding,
                TurnPhase::AwaitingPermission => FramePhase::AwaitingPermission,
            },
            transcript: self.transcript.clone(),
            breadcrumb: self
                .tool_history
                .iter()
                .map(|record| BreadcrumbEntry {
                    name: record.name.clone(),
                    repeats: record.repeats,
                    failed: record.failed,
                })
                .collect(),
            current_tool: self.current_tool.clone(),
            tasks: self
                .tasks
                .iter()
                .map(|task| FrameTask {
                    label: task.label.clone(),
                    done: task.done,
                })
                .collect(),
            permission_prompt: self
                .pending_permission
                .as_ref()
                .map(crate::permission::permission_prompt_text),
            usage: FrameUsage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
                cost_usd: self.usage.cost_usd,
            },
            outcome: outcome.map(TurnOutcome::as_frame_outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TurnPhase, TurnState};
    use courier_backend::{CapabilityClass, PermissionRequest, StepUsage, ToolStatus};

    #[test]
    fn unit_merge_extends_transcript_when_snapshot_is_a_superset() {
        let mut state = TurnState::new();
        assert!(state.merge_transcript("Here is the"));
        assert!(state.merge_transcript("Here is the answer."));
        assert_eq!(state.transcript, "Here is the answer.");
    }

    #[test]
    fn unit_merge_is_idempotent_for_repeated_snapshots() {
        let mut state = TurnState::new();
        assert!(state.merge_transcript("same snapshot"));
        assert!(!state.merge_transcript("same snapshot"));
        assert!(!state.merge_transcript("snapshot"));
        assert_eq!(state.transcript, "same snapshot");
    }

    #[test]
    fn unit_merge_appends_unrelated_text_with_a_boundary() {
        let mut state = TurnState::new();
        state.merge_transcript("first part");
        state.merge_transcript("second part");
        assert_eq!(state.transcript, "first part\n\nsecond part");
    }

    #[test]
    fn unit_merge_keeps_longer_text_for_stale_prefix_snapshots() {
        let mut state = TurnState::new();
        state.merge_transcript("Here is the answer.");
        assert!(!state.merge_transcript("Here is the"));
        assert_eq!(state.transcript, "Here is the answer.");
    }

    #[test]
    fn unit_step_crediting_is_keyed_by_step_id() {
        let mut state = TurnState::new();
        let usage = StepUsage {
            input_tokens: 100,
            output_tokens: 40,
            cost_usd: 0.01,
        };
        assert!(state.credit_step("step-1", usage));
        assert!(!state.credit_step("step-1", usage));
        assert!(!state.credit_step("step-1", usage));
        assert!(state.credit_step("step-2", usage));
        assert_eq!(state.usage().input_tokens, 200);
        assert_eq!(state.usage().output_tokens, 80);
    }

    #[test]
    fn unit_consecutive_identical_tools_collapse_into_one_record() {
        let mut state = TurnState::new();
        state.apply_tool_state("grep", None, ToolStatus::Running);
        state.apply_tool_state("grep", None, ToolStatus::Completed);
        state.apply_tool_state("grep", None, ToolStatus::Running);
        state.apply_tool_state("grep", None, ToolStatus::Completed);
        state.apply_tool_state("edit", None, ToolStatus::Running);
        state.apply_tool_state("edit", None, ToolStatus::Error);
        assert_eq!(state.tool_history.len(), 2);
        assert_eq!(state.tool_history[0].repeats, 2);
        assert!(!state.tool_history[0].failed);
        assert!(state.tool_history[1].failed);
        assert!(state.current_tool.is_none());
    }

    #[test]
    fn unit_tool_title_wins_over_the_raw_name_when_present() {
        let mut state = TurnState::new();
        state.apply_tool_state("bash", Some("Install dependencies"), ToolStatus::Running);
        assert_eq!(state.current_tool.as_deref(), Some("Install dependencies"));
        state.apply_tool_state("bash", Some("Install dependencies"), ToolStatus::Completed);
        assert_eq!(state.tool_history[0].name, "Install dependencies");
        // A blank title falls back to the tool name.
        state.apply_tool_state("bash", Some("  "), ToolStatus::Running);
        assert_eq!(state.current_tool.as_deref(), Some("bash"));
        // Queued reports change nothing visible.
        assert!(!state.apply_tool_state("bash", None, ToolStatus::Queued));
    }

    #[test]
    fn unit_phase_transitions_report_changes_for_forced_flushes() {
        let mut state = TurnState::new();
        assert!(state.note_reasoning());
        assert!(!state.note_reasoning());
        assert!(state.apply_tool_state("bash", None, ToolStatus::Running));
        assert!(!state.apply_tool_state("bash", None, ToolStatus::Running));
        assert_eq!(state.phase, TurnPhase::ToolRunning);
    }

    #[test]
    fn unit_abort_clears_pending_permission_and_current_tool() {
        let mut state = TurnState::new();
        state.apply_tool_state("bash", None, ToolStatus::Running);
        state.begin_permission(PermissionRequest {
            id: "p1".to_string(),
            tool_name: "bash".to_string(),
            description: "run a command".to_string(),
            capability: CapabilityClass::Mutating,
        });
        state.mark_aborted();
        assert!(state.aborted());
        assert!(state.pending_permission.is_none());
        assert!(state.current_tool.is_none());
    }

    #[test]
    fn unit_frame_projection_carries_permission_prompt() {
        let mut state = TurnState::new();
        state.begin_permission(PermissionRequest {
            id: "p1".to_string(),
            tool_name: "bash".to_string(),
            description: "run `cargo test`".to_string(),
            capability: CapabilityClass::Mutating,
        });
        let frame = state.to_frame(None);
        let prompt = frame.permission_prompt.expect("prompt");
        assert!(prompt.contains("bash"));
        assert!(prompt.contains("cargo test"));
    }
}
