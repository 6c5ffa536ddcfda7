//! Host-facing progress and terminal status of a load.

use serde::Serialize;

pub const MSG_COMPLETE: &str = "Load complete";
pub const MSG_CANCELLED: &str = "Load cancelled (partial data kept)";
pub const MSG_FAILED_PREFIX: &str = "Failed to load simulation";

/// Snapshot polled by the host every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct LoadProgress {
    pub in_progress: bool,
    /// 0.0 to 100.0, never decreasing within one load
    pub progress_pct: f64,
    pub message: String,
    pub loaded_agent_count: usize,
}

impl LoadProgress {
    /// Progress at the start of a load.
    pub fn starting(message: impl Into<String>) -> Self {
        Self {
            in_progress: true,
            progress_pct: 0.0,
            message: message.into(),
            loaded_agent_count: 0,
        }
    }

    /// Move forward to `pct` with a new message. Progress never goes back.
    pub fn advance(&mut self, pct: f64, message: impl Into<String>) {
        self.progress_pct = self.progress_pct.max(pct.clamp(0.0, 100.0));
        self.message = message.into();
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Linear progress inside a stage window, clamped to its end.
pub fn stage_progress(start: f64, end: f64, processed: usize, total: usize) -> f64 {
    if total == 0 {
        return end;
    }
    let fraction = processed as f64 / total as f64;
    (start + fraction * (end - start)).min(end)
}

/// How a load ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadStatus {
    Complete,
    Cancelled { partial_data_retained: bool },
    Failed { message: String },
}

impl LoadStatus {
    /// Message shown to the user.
    pub fn message(&self) -> String {
        match self {
            LoadStatus::Complete => MSG_COMPLETE.to_string(),
            LoadStatus::Cancelled { .. } => MSG_CANCELLED.to_string(),
            LoadStatus::Failed { message } => format!("{MSG_FAILED_PREFIX}: {message}"),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, LoadStatus::Complete)
    }
}
