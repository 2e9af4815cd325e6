//! Action plans: the ordered tool invocations that realize a goal.

use std::collections::HashMap;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::goal::{Goal, GoalId};
use super::safety::ResourceDelta;
use super::tool::{ToolInput, ToolSignature};

/// Errors from plan generation.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum PlanningError {
    #[error("no viable plan for {goal_id}: {reason}")]
    #[diagnostic(
        code(evo::plan::no_viable_plan),
        help("Give the goal at least one capability hint that names an available tool.")
    )]
    NoViablePlan { goal_id: GoalId, reason: String },

    #[error("plan for {goal_id} needs unavailable tool \"{tool_name}\"")]
    #[diagnostic(
        code(evo::plan::unknown_tool),
        help("Register the tool in the capability registry or drop it from the goal's hints.")
    )]
    UnknownTool { goal_id: GoalId, tool_name: String },
}

/// Result type for planning.
pub type PlanningResult<T> = std::result::Result<T, PlanningError>;

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: ToolInput,
    /// Declared cost, charged when the step is dispatched.
    pub cost: ResourceDelta,
    /// Optional steps may fail without failing the goal.
    pub required: bool,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: ToolInput::new(),
            cost: ResourceDelta::default(),
            required: true,
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments = self.arguments.with_param(name, value);
        self
    }

    pub fn with_cost(mut self, cost: ResourceDelta) -> Self {
        self.cost = cost;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// An ordered, immutable sequence of tool invocations for one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    goal_id: GoalId,
    steps: Vec<ToolInvocation>,
}

impl ActionPlan {
    pub fn new(goal_id: GoalId, steps: Vec<ToolInvocation>) -> Self {
        Self { goal_id, steps }
    }

    pub fn goal_id(&self) -> GoalId {
        self.goal_id
    }

    pub fn steps(&self) -> &[ToolInvocation] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&ToolInvocation> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Turns a goal into a plan over the tools currently available.
pub trait Planner: Send + Sync {
    fn generate_plan(&self, goal: &Goal, available: &[ToolSignature])
    -> PlanningResult<ActionPlan>;
}

/// Builds one step per capability hint, in hint order.
///
/// Each step receives the goal description as its `goal` argument. Its cost
/// is the tool-specific cost if one is configured, else the default step cost.
#[derive(Debug, Clone, Default)]
pub struct HintPlanner {
    step_cost: ResourceDelta,
    tool_costs: HashMap<String, ResourceDelta>,
}

impl HintPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step_cost(mut self, cost: ResourceDelta) -> Self {
        self.step_cost = cost;
        self
    }

    pub fn with_tool_cost(mut self, tool_name: impl Into<String>, cost: ResourceDelta) -> Self {
        self.tool_costs.insert(tool_name.into(), cost);
        self
    }

    fn cost_of(&self, tool_name: &str) -> ResourceDelta {
        self.tool_costs
            .get(tool_name)
            .copied()
            .unwrap_or(self.step_cost)
    }
}

impl Planner for HintPlanner {
    fn generate_plan(
        &self,
        goal: &Goal,
        available: &[ToolSignature],
    ) -> PlanningResult<ActionPlan> {
        if goal.capabilities.is_empty() {
            return Err(PlanningError::NoViablePlan {
                goal_id: goal.id,
                reason: "goal names no capabilities".into(),
            });
        }

        let steps = goal
            .capabilities
            .iter()
            .map(|hint| {
                if !available.iter().any(|sig| &sig.name == hint) {
                    return Err(PlanningError::UnknownTool {
                        goal_id: goal.id,
                        tool_name: hint.clone(),
                    });
                }
                Ok(ToolInvocation::new(hint.as_str())
                    .with_arg("goal", goal.description.as_str())
                    .with_cost(self.cost_of(hint)))
            })
            .collect::<PlanningResult<Vec<_>>>()?;

        Ok(ActionPlan::new(goal.id, steps))
    }
}
