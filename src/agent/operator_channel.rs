//! Operator override channel.
//!
//! An `OverrideHandle` lets a UI or signal handler queue operator commands;
//! the control loop drains them at the start of the next tick.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use miette::Diagnostic;
use thiserror::Error;

/// A command from the human operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideCommand {
    /// Leave SafetyOverride once the triggering condition is resolved.
    ClearOverride,
    /// Stop selecting and executing goals.
    Pause,
    Resume,
    /// Deny a specific action.
    Block { action: String },
    Unblock { action: String },
    /// Zero resource usage after an operator cleanup.
    ResetUsage,
}

impl fmt::Display for OverrideCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClearOverride => f.write_str("clear"),
            Self::Pause => f.write_str("pause"),
            Self::Resume => f.write_str("resume"),
            Self::Block { action } => write!(f, "block {action}"),
            Self::Unblock { action } => write!(f, "unblock {action}"),
            Self::ResetUsage => f.write_str("reset-usage"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("unknown operator command: \"{input}\"")]
#[diagnostic(
    code(evo::operator::parse),
    help("Expected one of: clear, pause, resume, block <action>, unblock <action>, reset-usage.")
)]
pub struct ParseCommandError {
    pub input: String,
}

impl FromStr for OverrideCommand {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (verb, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (trimmed, ""),
        };
        let err = || ParseCommandError {
            input: trimmed.to_string(),
        };
        match (verb.to_ascii_lowercase().as_str(), rest.is_empty()) {
            ("clear" | "clear-override", true) => Ok(Self::ClearOverride),
            ("pause", true) => Ok(Self::Pause),
            ("resume", true) => Ok(Self::Resume),
            ("reset-usage" | "reset", true) => Ok(Self::ResetUsage),
            ("block", false) => Ok(Self::Block {
                action: rest.to_string(),
            }),
            ("unblock", false) => Ok(Self::Unblock {
                action: rest.to_string(),
            }),
            _ => Err(err()),
        }
    }
}

// ── OverrideHandle ───────────────────────────────────────────────────────

/// Cloneable handle for queueing operator commands.
#[derive(Debug, Clone)]
pub struct OverrideHandle {
    queue: Arc<Mutex<VecDeque<OverrideCommand>>>,
}

impl OverrideHandle {
    pub fn signal(&self, command: OverrideCommand) {
        tracing::info!(command = %command, "operator command queued");
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(command);
    }

    /// Number of commands waiting for the next tick.
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ── OperatorChannel ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OperatorChannel {
    queue: Arc<Mutex<VecDeque<OverrideCommand>>>,
}

impl OperatorChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> OverrideHandle {
        OverrideHandle {
            queue: Arc::clone(&self.queue),
        }
    }

    /// Take every queued command in arrival order.
    pub fn drain(&self) -> Vec<OverrideCommand> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}
