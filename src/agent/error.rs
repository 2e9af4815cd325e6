//! Agent-layer error types with rich miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use super::capability::CapabilityError;
use super::exploration::ExplorationError;
use super::memory::MemoryError;
use super::metacognition::ReflectionError;
use super::plan::PlanningError;
use super::safety::SafetyError;
use super::tool::ToolError;

/// Errors from the autonomy control loop and its components.
#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    #[error("goal not found: goal#{goal_id}")]
    #[diagnostic(
        code(evo::agent::goal_not_found),
        help("The goal is not queued or active. It may already have been retired.")
    )]
    GoalNotFound { goal_id: u64 },

    #[error("invalid goal: {message}")]
    #[diagnostic(
        code(evo::agent::invalid_goal),
        help("Goals need a non-empty description.")
    )]
    InvalidGoal { message: String },

    #[error("goal#{goal_id} cannot move from {from} to {to}")]
    #[diagnostic(
        code(evo::agent::invalid_transition),
        help(
            "Goals move proposed -> evaluated -> selected -> executing -> terminal. \
             Only persistent goals return to evaluated after finishing."
        )
    )]
    InvalidTransition {
        goal_id: u64,
        from: String,
        to: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reflection(#[from] ReflectionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Exploration(#[from] ExplorationError),
}

/// Convenience alias for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
