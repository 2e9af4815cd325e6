//! Aggregate configuration for the control loop.
//!
//! Every section is a component's own config struct with serde defaults, so a
//! TOML file only needs the keys it changes. `EVO_*` environment variables
//! override the retry and safety limits after loading.

use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::control_loop::ControlLoopConfig;
use crate::agent::executor::ExecutorConfig;
use crate::agent::exploration::ExplorationConfig;
use crate::agent::feedback::FeedbackConfig;
use crate::agent::goal_manager::GoalManagerConfig;
use crate::agent::metacognition::ReflectionConfig;
use crate::agent::mode::ArbiterConfig;
use crate::agent::safety::SafetyConfig;

/// Errors from loading or validating configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(evo::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(evo::config::parse),
        help("Check the TOML syntax. `evo config` prints a complete default file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to serialize config: {message}")]
    #[diagnostic(code(evo::config::serialize))]
    Serialize { message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(evo::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {field}: {message}")]
    #[diagnostic(code(evo::config::invalid))]
    Invalid { field: String, message: String },

    #[error("environment override {var}={value} is not a valid number")]
    #[diagnostic(
        code(evo::config::env),
        help("Unset the variable or give it a plain numeric value.")
    )]
    EnvOverride { var: String, value: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Every tunable of the control loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvoConfig {
    pub arbiter: ArbiterConfig,
    pub goals: GoalManagerConfig,
    pub executor: ExecutorConfig,
    pub safety: SafetyConfig,
    pub feedback: FeedbackConfig,
    pub reflection: ReflectionConfig,
    pub exploration: ExplorationConfig,
    pub control: ControlLoopConfig,
}

/// Environment variables honored by [`EvoConfig::apply_env_overrides`].
pub const ENV_OVERRIDES: [&str; 6] = [
    "EVO_MAX_ATTEMPTS",
    "EVO_BASE_DELAY_MS",
    "EVO_STORAGE_LIMIT",
    "EVO_TIME_LIMIT_SECS",
    "EVO_ITERATION_LIMIT",
    "EVO_EXPLORATION_FRACTION",
];

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::EnvOverride {
        var: var.into(),
        value: value.into(),
    })
}

impl EvoConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, origin: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.into(),
            message: e.to_string(),
        })
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize {
            message: e.to_string(),
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Apply `EVO_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides, reading each variable through `lookup`.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for var in ENV_OVERRIDES {
            let Some(value) = lookup(var) else {
                continue;
            };
            match var {
                "EVO_MAX_ATTEMPTS" => self.executor.max_attempts = parse_env(var, &value)?,
                "EVO_BASE_DELAY_MS" => self.executor.base_delay_ms = parse_env(var, &value)?,
                "EVO_STORAGE_LIMIT" => self.safety.storage_limit_bytes = parse_env(var, &value)?,
                "EVO_TIME_LIMIT_SECS" => self.safety.time_limit_secs = parse_env(var, &value)?,
                "EVO_ITERATION_LIMIT" => self.safety.iteration_limit = parse_env(var, &value)?,
                "EVO_EXPLORATION_FRACTION" => {
                    self.exploration.exploration_fraction = parse_env(var, &value)?
                }
                _ => continue,
            }
            tracing::debug!(var, value = %value, "config override applied");
        }
        Ok(())
    }

    /// Reject values the components cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.executor.base_delay_ms > self.executor.max_delay_ms {
            return Err(invalid(
                "executor.base_delay_ms",
                "must not exceed executor.max_delay_ms",
            ));
        }
        if self.goals.max_internal_goals == 0 {
            return Err(invalid("goals.max_internal_goals", "must be at least 1"));
        }
        let w = &self.goals.scoring;
        for (field, value) in [
            ("goals.scoring.feasibility", w.feasibility),
            ("goals.scoring.learning_potential", w.learning_potential),
            ("goals.scoring.drive_alignment", w.drive_alignment),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, "must be a non-negative number"));
            }
        }
        if self.safety.soft_escalation_threshold == 0 {
            return Err(invalid("safety.soft_escalation_threshold", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.reflection.alpha) {
            return Err(invalid("reflection.alpha", "must lie in [0, 1]"));
        }
        if self.reflection.window == 0 {
            return Err(invalid("reflection.window", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.exploration.purpose_urgency) {
            return Err(invalid("exploration.purpose_urgency", "must lie in [0, 1]"));
        }
        self.exploration
            .validate()
            .map_err(|e| invalid("exploration.exploration_fraction", e.to_string()))?;
        if self.control.autonomous_steps_per_tick == 0 {
            return Err(invalid("control.autonomous_steps_per_tick", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_validate() {
        EvoConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EvoConfig::from_toml_str(
            r#"
            [executor]
            max_attempts = 5

            [exploration]
            exploration_fraction = 0.4
            "#,
        )
        .unwrap();
        assert_eq!(config.executor.max_attempts, 5);
        assert_eq!(config.executor.base_delay_ms, 100);
        assert!((config.exploration.exploration_fraction - 0.4).abs() < 1e-6);
        assert_eq!(config.safety, SafetyConfig::default());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evo.toml");
        let mut config = EvoConfig::default();
        config.safety.storage_limit_bytes = 100;
        config.exploration.seed = Some(9);
        config.save(&path).unwrap();
        assert_eq!(EvoConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = EvoConfig::from_toml_str("[executor\nmax_attempts = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = EvoConfig::load(Path::new("/nonexistent/evo.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("EVO_MAX_ATTEMPTS", "7"),
            ("EVO_STORAGE_LIMIT", "100"),
            ("EVO_EXPLORATION_FRACTION", "0.5"),
        ]
        .into_iter()
        .collect();
        let mut config = EvoConfig::default();
        config
            .apply_overrides_from(|v| vars.get(v).map(|s| s.to_string()))
            .unwrap();
        assert_eq!(config.executor.max_attempts, 7);
        assert_eq!(config.safety.storage_limit_bytes, 100);
        assert!((config.exploration.exploration_fraction - 0.5).abs() < 1e-6);
        assert_eq!(config.safety.time_limit_secs, 3_600);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = EvoConfig::default();
        let err = config
            .apply_overrides_from(|v| (v == "EVO_ITERATION_LIMIT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EnvOverride { .. }));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EvoConfig::default();
        config.exploration.exploration_fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = EvoConfig::default();
        config.executor.base_delay_ms = 5_000;
        assert!(config.validate().is_err());

        let mut config = EvoConfig::default();
        config.goals.scoring.feasibility = -1.0;
        assert!(config.validate().is_err());

        let mut config = EvoConfig::default();
        config.control.autonomous_steps_per_tick = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_toml_parses_back() {
        let text = EvoConfig::default().to_toml_string().unwrap();
        assert!(text.contains("[safety]"));
        assert_eq!(EvoConfig::from_toml_str(&text).unwrap(), EvoConfig::default());
    }
}
