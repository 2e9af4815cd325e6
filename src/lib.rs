// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # evo-autonomy
//!
//! An autonomy control loop: an agent that serves user goals first, pursues
//! its own goals when idle, and never acts outside its safety envelope.
//!
//! ## Architecture
//!
//! - **Mode arbiter** (`agent::mode`): Responsive / Autonomous / Hybrid / SafetyOverride
//! - **Goal manager** (`agent::goal_manager`): external FIFO plus scored internal candidates
//! - **Action executor** (`agent::executor`): plans run step by step with bounded retry
//! - **Safety monitor** (`agent::safety`): every step checked before dispatch
//! - **Feedback and reflection** (`agent::feedback`, `agent::metacognition`):
//!   observations feed a bounded self-model
//! - **Exploration** (`agent::exploration`): novelty goals and purpose synthesis
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use evo_autonomy::agent::builtin::{demo_planner, demo_registry};
//! use evo_autonomy::agent::{Collaborators, ControlLoop, InMemoryStore, QueueGateway};
//! use evo_autonomy::config::EvoConfig;
//! use evo_autonomy::message::StdoutSink;
//!
//! let gateway = QueueGateway::new();
//! let input = gateway.handle();
//! let mut control = ControlLoop::new(
//!     &EvoConfig::default(),
//!     Collaborators {
//!         planner: Box::new(demo_planner()),
//!         registry: Arc::new(demo_registry().unwrap()),
//!         memory: Arc::new(InMemoryStore::new()),
//!         perception: Box::new(gateway),
//!         sink: Arc::new(StdoutSink),
//!         initial_model: None,
//!     },
//! )
//! .unwrap();
//! input.push_user_with_hints("summarize the news", vec!["summarize".into()]);
//! control.run(3);
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod message;
