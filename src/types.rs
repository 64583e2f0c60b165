use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound of the normalized coordinate space the model clicks in.
pub const NORMALIZED_MAX: f64 = 1000.0;

/// A single atomic action the decision engine asks the agent to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Navigate { url: String },
    /// Coordinates are normalized to `[0, 1000]` on both axes.
    ClickAt { x: f64, y: f64 },
    Scroll { delta_y: f64 },
    Type { text: String },
    Wait { ms: u64 },
    Complete,
}

impl Action {
    pub fn label(&self) -> String {
        match self {
            Action::Navigate { url } => format!("navigate {url}"),
            Action::ClickAt { x, y } => format!("click_at ({x}, {y})"),
            Action::Scroll { delta_y } => format!("scroll {delta_y}px"),
            Action::Type { text } => format!("type {:?}", text),
            Action::Wait { ms } => format!("wait {ms}ms"),
            Action::Complete => "complete".to_string(),
        }
    }
}

/// Structured result of parsing one decision-engine reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub raw_text: String,
    pub actions: Vec<Action>,
    pub is_complete: bool,
    pub warnings: Vec<String>,
}

/// Layout size of the page surface in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Map a normalized `[0, 1000]` point onto this viewport, clamping out-of-range input.
    pub fn to_pixels(&self, nx: f64, ny: f64) -> (f64, f64) {
        let clamp = |v: f64| {
            if v.is_nan() {
                0.0
            } else {
                v.clamp(0.0, NORMALIZED_MAX)
            }
        };
        let px = clamp(nx) / NORMALIZED_MAX * self.width.max(0.0);
        let py = clamp(ny) / NORMALIZED_MAX * self.height.max(0.0);
        (px, py)
    }
}

/// One perception cycle's output.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// PNG bytes, base64 encoded.
    pub encoded_image: String,
    pub viewport: Viewport,
    pub content_hash: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Model,
    Action,
    Result,
    Error,
    Warning,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Info => "info",
            LogKind::Model => "model",
            LogKind::Action => "action",
            LogKind::Result => "result",
            LogKind::Error => "error",
            LogKind::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
}

/// Point-in-time view of the controller, for callers and the web console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub goal: String,
    pub current_step: u32,
    pub step_budget: u32,
    pub awaiting_safety_confirmation: bool,
    pub pending_actions: Option<Vec<Action>>,
    pub model: Option<String>,
}
