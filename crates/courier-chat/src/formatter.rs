//! Pure render helpers: project a turn's visible state into chat-ready text.

/// Phase of the in-flight turn as the formatter needs to label it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Thinking,
    Reasoning,
    ToolRunning,
    Responding,
    AwaitingPermission,
}

impl FramePhase {
    fn indicator(self) -> &'static str {
        match self {
            Self::Thinking => "thinking…",
            Self::Reasoning => "reasoning…",
            Self::ToolRunning => "running tools…",
            Self::Responding => "responding…",
            Self::AwaitingPermission => "waiting for approval",
        }
    }
}

/// One collapsed breadcrumb entry: a tool name with its repeat count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreadcrumbEntry {
    pub name: String,
    pub repeats: usize,
    pub failed: bool,
}

/// One entry of the backend task list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTask {
    pub label: String,
    pub done: bool,
}

/// Accumulated token/cost totals for the footer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// Terminal state of a finished turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Done,
    Stopped,
    Failed,
}

impl FrameOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Read-only projection of a turn handed to the formatter.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderFrame {
    pub phase: FramePhase,
    pub transcript: String,
    pub breadcrumb: Vec<BreadcrumbEntry>,
    pub current_tool: Option<String>,
    pub tasks: Vec<FrameTask>,
    pub permission_prompt: Option<String>,
    pub usage: FrameUsage,
    pub outcome: Option<FrameOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderStyle {
    Rich,
    Plain,
}

/// Renders the frame with light markdown markup.
pub fn render_frame(frame: &RenderFrame) -> String {
    render_with_style(frame, RenderStyle::Rich)
}

/// Degraded render used after the transport rejects formatted markup.
pub fn render_frame_plain(frame: &RenderFrame) -> String {
    render_with_style(frame, RenderStyle::Plain)
}

fn render_with_style(frame: &RenderFrame, style: RenderStyle) -> String {
    if let Some(prompt) = frame
        .permission_prompt
        .as_deref()
        .filter(|prompt| !prompt.trim().is_empty())
    {
        return render_permission_prompt(prompt, style);
    }

    let transcript = frame.transcript.trim();
    let mut sections: Vec<String> = Vec::new();

    if !transcript.is_empty() {
        sections.push(transcript.to_string());
    } else if frame.outcome.is_none() {
        let mut working = Vec::new();
        if let Some(breadcrumb) = render_breadcrumb(&frame.breadcrumb, style) {
            working.push(breadcrumb);
        }
        if let Some(tasks) = render_task_list(&frame.tasks) {
            working.push(tasks);
        }
        sections.push(working.join("\n"));
    }

    match frame.outcome {
        Some(outcome) => sections.push(render_terminal_footer(frame, outcome, style)),
        None => sections.push(render_working_footer(frame, style)),
    }

    sections
        .into_iter()
        .filter(|section| !section.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_permission_prompt(prompt: &str, style: RenderStyle) -> String {
    match style {
        RenderStyle::Rich => format!("⚠️ *Approval needed*\n\n{prompt}"),
        RenderStyle::Plain => format!("Approval needed\n\n{prompt}"),
    }
}

fn render_breadcrumb(entries: &[BreadcrumbEntry], style: RenderStyle) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let rendered = entries
        .iter()
        .map(|entry| {
            let mut label = match style {
                RenderStyle::Rich => format!("`{}`", entry.name),
                RenderStyle::Plain => entry.name.clone(),
            };
            if entry.repeats > 1 {
                label.push_str(&format!(" ×{}", entry.repeats));
            }
            if entry.failed {
                label.push_str(" ✗");
            }
            label
        })
        .collect::<Vec<_>>()
        .join(" → ");
    Some(rendered)
}

fn render_task_list(tasks: &[FrameTask]) -> Option<String> {
    if tasks.is_empty() {
        return None;
    }
    let rendered = tasks
        .iter()
        .map(|task| {
            let marker = if task.done { "☑" } else { "☐" };
            format!("{marker} {}", task.label)
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(rendered)
}

fn render_working_footer(frame: &RenderFrame, style: RenderStyle) -> String {
    let mut footer = frame.phase.indicator().to_string();
    if let Some(tool) = frame
        .current_tool
        .as_deref()
        .filter(|tool| !tool.trim().is_empty())
    {
        footer = match style {
            RenderStyle::Rich => format!("{footer} `{tool}`"),
            RenderStyle::Plain => format!("{footer} {tool}"),
        };
    }
    match style {
        RenderStyle::Rich => format!("_{footer}_"),
        RenderStyle::Plain => footer,
    }
}

fn render_terminal_footer(frame: &RenderFrame, outcome: FrameOutcome, style: RenderStyle) -> String {
    let usage = frame.usage;
    let footer = format!(
        "{} | tokens {}/{} | cost ${:.4}",
        outcome.label(),
        usage.input_tokens,
        usage.output_tokens,
        usage.cost_usd
    );
    match style {
        RenderStyle::Rich => format!("_{footer}_"),
        RenderStyle::Plain => footer,
    }
}
