//! Rich diagnostic error types for the evo crate.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]`
//! derives; [`EvoError`] carries them to the binary with codes and help text
//! intact.

use miette::Diagnostic;
use thiserror::Error;

use crate::agent::error::AgentError;
use crate::config::ConfigError;

/// Top-level error type.
#[derive(Debug, Error, Diagnostic)]
pub enum EvoError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

/// Convenience alias for crate-level results.
pub type EvoResult<T> = std::result::Result<T, EvoError>;
