//! Goals: units of work competing for the executor.
//!
//! External goals come from user input, internal goals from the drives and
//! the exploration scheduler. A goal moves through
//! `Proposed -> Evaluated -> Selected -> Executing` and ends in one of the
//! terminal states.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::drives::DriveKind;
use super::error::{AgentError, AgentResult};

/// Monotonic goal identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GoalId(u64);

impl GoalId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "goal#{}", self.0)
    }
}

/// Who asked for the goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalOrigin {
    External,
    Internal,
}

impl GoalOrigin {
    pub fn label(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Internal => "internal",
        }
    }
}

/// What sort of work the goal represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GoalKind {
    /// Ordinary task: user request or drive proposal.
    Task,
    /// Exercise a capability that has never been used.
    Novelty { capability: String },
    /// Persistent search for purpose, emitted after enough insight accumulates.
    PurposeSynthesis,
}

impl GoalKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Novelty { .. } => "novelty",
            Self::PurposeSynthesis => "purpose",
        }
    }
}

/// Lifecycle status of a goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GoalStatus {
    Proposed,
    Evaluated,
    Selected,
    Executing,
    Completed,
    Failed { reason: String },
    Abandoned { reason: String },
}

impl GoalStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Evaluated => "evaluated",
            Self::Selected => "selected",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Abandoned { .. } => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::Abandoned { .. }
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Re-evaluation is always allowed for queued goals, and a persistent goal
    /// may drop back to `Evaluated` after it has executed.
    pub fn can_transition_to(&self, next: &GoalStatus) -> bool {
        use GoalStatus::*;
        match (self, next) {
            (Proposed | Evaluated, Evaluated) => true,
            (Evaluated, Selected) => true,
            (Selected, Executing) => true,
            (Selected | Executing, Evaluated) => true,
            (Proposed | Evaluated | Selected | Executing, Abandoned { .. }) => true,
            (Selected | Executing, Completed | Failed { .. }) => true,
            (Completed | Failed { .. }, Evaluated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Abandoned { reason } => write!(f, "abandoned: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// A goal competing for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub origin: GoalOrigin,
    /// Set for internal goals only.
    pub drive: Option<DriveKind>,
    pub kind: GoalKind,
    pub description: String,
    /// Tool names the planner should use.
    pub capabilities: Vec<String>,
    /// Last computed score in [0, 1].
    pub priority: f32,
    /// Multiplier on the score in [0, 1].
    pub urgency: f32,
    pub status: GoalStatus,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    /// Creation order, used to break scoring ties.
    pub sequence: u64,
}

impl Goal {
    /// A user-requested goal.
    pub fn external(
        id: GoalId,
        sequence: u64,
        description: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            id,
            origin: GoalOrigin::External,
            drive: None,
            kind: GoalKind::Task,
            description: description.into(),
            capabilities,
            priority: 0.0,
            urgency: 1.0,
            status: GoalStatus::Proposed,
            created_at: now_secs(),
            sequence,
        }
    }

    /// A self-generated goal serving `drive`.
    pub fn internal(
        id: GoalId,
        sequence: u64,
        drive: DriveKind,
        kind: GoalKind,
        description: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            id,
            origin: GoalOrigin::Internal,
            drive: Some(drive),
            kind,
            description: description.into(),
            capabilities,
            priority: 0.0,
            urgency: 1.0,
            status: GoalStatus::Proposed,
            created_at: now_secs(),
            sequence,
        }
    }

    pub fn with_urgency(mut self, urgency: f32) -> Self {
        self.urgency = clamp_unit(urgency);
        self
    }

    pub fn is_external(&self) -> bool {
        self.origin == GoalOrigin::External
    }

    /// Persistent goals return to the candidate set after executing.
    pub fn is_persistent(&self) -> bool {
        self.kind == GoalKind::PurposeSynthesis
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: GoalStatus) -> AgentResult<()> {
        if !self.status.can_transition_to(&next) {
            return Err(AgentError::InvalidTransition {
                goal_id: self.id.get(),
                from: self.status.label().into(),
                to: next.label().into(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Reject empty or whitespace-only goal descriptions.
pub fn validate_description(description: &str) -> AgentResult<()> {
    if description.trim().is_empty() {
        return Err(AgentError::InvalidGoal {
            message: "goal description must not be empty".into(),
        });
    }
    Ok(())
}

/// Clamp to [0, 1], mapping NaN to 0.
pub fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
