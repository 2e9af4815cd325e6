//! Per-tick status records and the sinks that render them.
//!
//! The control loop never prints. Each tick it emits one [`TickStatus`] to a
//! [`StatusSink`]: a terminal renderer, a JSON line stream, or an in-memory
//! collector for tests.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::agent::executor::ExecutionResult;
use crate::agent::goal::{GoalId, GoalOrigin};
use crate::agent::mode::{Mode, Track};

// ── Status types ────────────────────────────────────────────────────────

/// Condensed outcome of one finished goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub goal_id: GoalId,
    pub origin: GoalOrigin,
    pub track: Track,
    /// "completed", "failed" or "cancelled".
    pub status: String,
    pub description: String,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&ExecutionResult> for ResultSummary {
    fn from(result: &ExecutionResult) -> Self {
        let detail = result
            .planning_error
            .clone()
            .or_else(|| result.partial_outputs.last().cloned());
        Self {
            goal_id: result.goal.id,
            origin: result.goal.origin,
            track: result.track,
            status: result.status.label().to_string(),
            description: result.goal.description.clone(),
            steps: result.steps.len(),
            detail,
        }
    }
}

/// What the loop did in one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickStatus {
    pub tick: u64,
    pub mode: Mode,
    /// User goal run on the responsive track this tick.
    pub active_goal_id: Option<GoalId>,
    /// Internal goal in flight on the autonomous track after this tick.
    pub autonomous_goal_id: Option<GoalId>,
    pub last_result: Option<ResultSummary>,
    pub paused: bool,
}

/// Trait for rendering tick status records.
pub trait StatusSink: Send + Sync {
    fn emit(&self, status: &TickStatus);
}

// ── StdoutSink ──────────────────────────────────────────────────────────

/// One human-readable line per tick.
pub struct StdoutSink;

impl StdoutSink {
    fn render(status: &TickStatus) -> String {
        let mut line = format!("[tick {}] mode={}", status.tick, status.mode);
        if status.paused {
            line.push_str(" (paused)");
        }
        if let Some(id) = status.active_goal_id {
            line.push_str(&format!(" active={id}"));
        }
        if let Some(id) = status.autonomous_goal_id {
            line.push_str(&format!(" autonomous={id}"));
        }
        if let Some(result) = &status.last_result {
            line.push_str(&format!(
                " | {} {} \"{}\"",
                result.goal_id, result.status, result.description
            ));
            if let Some(detail) = &result.detail {
                line.push_str(&format!(": {detail}"));
            }
        }
        line
    }
}

impl StatusSink for StdoutSink {
    fn emit(&self, status: &TickStatus) {
        println!("{}", Self::render(status));
    }
}

// ── JsonSink ────────────────────────────────────────────────────────────

/// One JSON object per line.
pub struct JsonSink;

impl StatusSink for JsonSink {
    fn emit(&self, status: &TickStatus) {
        match serde_json::to_string(status) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::warn!(error = %e, tick = status.tick, "failed to serialize tick status"),
        }
    }
}

// ── VecSink ─────────────────────────────────────────────────────────────

/// Collects status records in memory.
#[derive(Default)]
pub struct VecSink {
    records: Mutex<Vec<TickStatus>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TickStatus> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<TickStatus> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl StatusSink for VecSink {
    fn emit(&self, status: &TickStatus) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status.clone());
    }
}
