//! Agent layer: the autonomy control loop and its components.
//!
//! - **Mode arbitration** (`mode`): one operating mode per tick
//! - **Goals** (`goal`, `goal_manager`, `drives`): the external FIFO, drive
//!   proposals, scoring, and track-filtered selection
//! - **Execution** (`plan`, `executor`, `tool`, `capability`): plans dispatched
//!   through the capability registry with bounded retry
//! - **Safety** (`safety`): hard and soft constraints, resource budgets, overrides
//! - **Learning** (`feedback`, `memory`, `metacognition`, `exploration`):
//!   observations, reflection, and the self-model
//! - **Control loop** (`control_loop`): the tick that wires it all together

pub mod builtin;
pub mod capability;
pub mod control_loop;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod drives;
pub mod error;
pub mod executor;
pub mod exploration;
pub mod feedback;
pub mod goal;
pub mod goal_manager;
pub mod memory;
pub mod metacognition;
pub mod mode;
pub mod operator_channel;
pub mod perception;
pub mod plan;
pub mod safety;
pub mod tool;

pub use capability::{CapabilityRegistry, CapabilityTable};
pub use control_loop::{Collaborators, ControlLoop, ControlLoopConfig};
pub use error::{AgentError, AgentResult};
pub use executor::{ActionExecutor, ExecutionResult, ExecutionStatus, RetryPolicy};
pub use goal::{Goal, GoalId, GoalKind, GoalOrigin, GoalStatus};
pub use goal_manager::GoalManager;
pub use memory::{InMemoryStore, MemoryStore};
pub use metacognition::{SelfModel, SelfModelReader};
pub use mode::{Mode, Track};
pub use operator_channel::{OverrideCommand, OverrideHandle};
pub use perception::{InputHandle, PerceptionGateway, QueueGateway};
pub use plan::{ActionPlan, HintPlanner, Planner, ToolInvocation};
pub use safety::{SafetyConfig, SafetyMonitor};
pub use tool::{Tool, ToolInput, ToolOutput, ToolSignature};
