//! Metacognition: the self-model and the reflection engine that tunes it.
//!
//! The [`SelfModel`] holds per-capability confidence, per-drive strategy
//! weights, and the goal-scoring weights. Every value lives in [0, 1].
//! Exactly one [`SelfModelWriter`] exists, owned by the [`ReflectionEngine`];
//! everything else reads immutable snapshots through [`SelfModelReader`]s.
//!
//! Reflection blends new evidence into the model with a clamped exponential
//! moving average, so no sequence of observations can push a value out of
//! range.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::drives::DriveKind;
use super::feedback::{Observation, Outcome, ReflectionTrigger};
use super::goal::{clamp_unit, now_secs};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from reflection and self-model persistence.
#[derive(Debug, Error, Diagnostic)]
pub enum ReflectionError {
    #[error("malformed observation {observation_id}: {reason}")]
    #[diagnostic(
        code(evo::reflection::malformed_observation),
        help("The self-model was left unchanged. Check the feedback processor's output.")
    )]
    MalformedObservation { observation_id: u64, reason: String },

    #[error("failed to read or write self-model state at {path}")]
    #[diagnostic(
        code(evo::reflection::state_io),
        help("Check that the state file's directory exists and is writable.")
    )]
    StateIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("self-model state is not valid JSON: {message}")]
    #[diagnostic(
        code(evo::reflection::state_format),
        help("Delete the state file to start from the default self-model.")
    )]
    StateFormat { message: String },
}

/// Result type for reflection operations.
pub type ReflectionResult<T> = std::result::Result<T, ReflectionError>;

// ---------------------------------------------------------------------------
// Self-model
// ---------------------------------------------------------------------------

/// Weights of the three goal-scoring components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub feasibility: f32,
    pub learning_potential: f32,
    pub drive_alignment: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            feasibility: 1.0,
            learning_potential: 1.0,
            drive_alignment: 1.0,
        }
    }
}

impl ScoringWeights {
    fn clamped(self) -> Self {
        Self {
            feasibility: clamp_unit(self.feasibility),
            learning_potential: clamp_unit(self.learning_potential),
            drive_alignment: clamp_unit(self.drive_alignment),
        }
    }
}

/// The agent's bounded model of itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfModel {
    /// Confidence per capability name.
    pub capabilities: BTreeMap<String, f32>,
    /// Strategy weight per drive.
    pub drive_weights: BTreeMap<DriveKind, f32>,
    pub scoring: ScoringWeights,
    /// Confidence assumed for capabilities never observed.
    pub default_confidence: f32,
    /// Incremented on every published update.
    pub revision: u64,
}

impl Default for SelfModel {
    fn default() -> Self {
        Self {
            capabilities: BTreeMap::new(),
            drive_weights: DriveKind::ALL.iter().map(|d| (*d, 0.5)).collect(),
            scoring: ScoringWeights::default(),
            default_confidence: 0.5,
            revision: 0,
        }
    }
}

impl SelfModel {
    pub fn with_scoring(scoring: ScoringWeights) -> Self {
        Self {
            scoring: scoring.clamped(),
            ..Self::default()
        }
    }

    pub fn confidence(&self, capability: &str) -> f32 {
        self.capabilities
            .get(capability)
            .copied()
            .unwrap_or(self.default_confidence)
    }

    pub fn set_confidence(&mut self, capability: impl Into<String>, value: f32) {
        self.capabilities.insert(capability.into(), clamp_unit(value));
    }

    pub fn drive_weight(&self, drive: DriveKind) -> f32 {
        self.drive_weights
            .get(&drive)
            .copied()
            .unwrap_or(self.default_confidence)
    }

    pub fn set_drive_weight(&mut self, drive: DriveKind, value: f32) {
        self.drive_weights.insert(drive, clamp_unit(value));
    }

    /// Pull every value back into [0, 1]. Applied to loaded state.
    pub fn clamp_all(&mut self) {
        for v in self.capabilities.values_mut() {
            *v = clamp_unit(*v);
        }
        for v in self.drive_weights.values_mut() {
            *v = clamp_unit(*v);
        }
        self.scoring = self.scoring.clamped();
        self.default_confidence = clamp_unit(self.default_confidence);
    }

    /// Whether every stored value lies in [0, 1].
    pub fn is_bounded(&self) -> bool {
        let unit = |v: &f32| (0.0..=1.0).contains(v);
        self.capabilities.values().all(unit)
            && self.drive_weights.values().all(unit)
            && unit(&self.scoring.feasibility)
            && unit(&self.scoring.learning_potential)
            && unit(&self.scoring.drive_alignment)
            && unit(&self.default_confidence)
    }

    pub fn load(path: &Path) -> ReflectionResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ReflectionError::StateIo {
            path: path.display().to_string(),
            source,
        })?;
        let mut model: SelfModel =
            serde_json::from_str(&text).map_err(|e| ReflectionError::StateFormat {
                message: e.to_string(),
            })?;
        model.clamp_all();
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> ReflectionResult<()> {
        let text = serde_json::to_string_pretty(self).map_err(|e| ReflectionError::StateFormat {
            message: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(|source| ReflectionError::StateIo {
            path: path.display().to_string(),
            source,
        })
    }
}

/// `old + alpha * (signal - old)`, clamped to [0, 1].
///
/// A non-finite signal leaves `old` unchanged.
pub fn ema_update(old: f32, signal: f32, alpha: f32) -> f32 {
    let old = clamp_unit(old);
    if !signal.is_finite() {
        return old;
    }
    let alpha = clamp_unit(alpha);
    clamp_unit(old + alpha * (signal - old))
}

type Cell = Arc<RwLock<Arc<SelfModel>>>;

/// The single write handle; not `Clone`.
#[derive(Debug)]
pub struct SelfModelWriter {
    cell: Cell,
}

/// A read handle returning immutable snapshots.
#[derive(Debug, Clone)]
pub struct SelfModelReader {
    cell: Cell,
}

/// Create the writer and a first reader over `initial`.
pub fn self_model_channel(initial: SelfModel) -> (SelfModelWriter, SelfModelReader) {
    let cell: Cell = Arc::new(RwLock::new(Arc::new(initial)));
    (
        SelfModelWriter {
            cell: Arc::clone(&cell),
        },
        SelfModelReader { cell },
    )
}

impl SelfModelWriter {
    /// Replace the published model in one swap.
    pub fn publish(&self, mut model: SelfModel) {
        model.clamp_all();
        let mut slot = self.cell.write().unwrap_or_else(PoisonError::into_inner);
        model.revision = slot.revision + 1;
        *slot = Arc::new(model);
    }

    pub fn snapshot(&self) -> Arc<SelfModel> {
        Arc::clone(&self.cell.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn reader(&self) -> SelfModelReader {
        SelfModelReader {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl SelfModelReader {
    pub fn snapshot(&self) -> Arc<SelfModel> {
        Arc::clone(&self.cell.read().unwrap_or_else(PoisonError::into_inner))
    }
}

// ---------------------------------------------------------------------------
// Reflection
// ---------------------------------------------------------------------------

/// Reflection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Most recent observations read per reflection (default: 20).
    pub window: usize,
    /// EMA blending factor in [0, 1] (default: 0.3).
    pub alpha: f32,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            window: 20,
            alpha: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflectionState {
    Idle,
    Reflecting,
}

/// One change reflection made to the self-model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    /// `capability:<name>` or `drive:<name>`.
    pub subject: String,
    pub before: f32,
    pub after: f32,
    pub evidence: usize,
}

impl Insight {
    pub fn delta(&self) -> f32 {
        self.after - self.before
    }
}

/// Append-only record of one reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub id: u64,
    pub timestamp: u64,
    pub trigger: ReflectionTrigger,
    /// Observations read.
    pub window: usize,
    pub insights: Vec<Insight>,
    /// Total absolute change applied to the self-model.
    pub insight_score: f32,
}

/// A reflection that failed and was discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: u64,
    pub trigger: ReflectionTrigger,
    pub message: String,
}

/// Learns from observations and publishes self-model updates.
#[derive(Debug)]
pub struct ReflectionEngine {
    config: ReflectionConfig,
    state: ReflectionState,
    writer: SelfModelWriter,
    records: Vec<ReflectionRecord>,
    errors: Vec<ErrorEvent>,
    next_id: u64,
}

impl ReflectionEngine {
    pub fn new(config: ReflectionConfig, writer: SelfModelWriter) -> Self {
        Self {
            config,
            state: ReflectionState::Idle,
            writer,
            records: Vec::new(),
            errors: Vec::new(),
            next_id: 1,
        }
    }

    pub fn state(&self) -> ReflectionState {
        self.state
    }

    pub fn reader(&self) -> SelfModelReader {
        self.writer.reader()
    }

    pub fn records(&self) -> &[ReflectionRecord] {
        &self.records
    }

    pub fn errors(&self) -> &[ErrorEvent] {
        &self.errors
    }

    /// Reflect over `observations` (oldest first).
    ///
    /// On success the new self-model is published and the record is
    /// returned. On failure the self-model is untouched, an [`ErrorEvent`]
    /// is kept, and `None` is returned.
    pub fn reflect(
        &mut self,
        trigger: ReflectionTrigger,
        observations: &[Observation],
    ) -> Option<&ReflectionRecord> {
        self.state = ReflectionState::Reflecting;
        let outcome = self.compute(observations);
        self.state = ReflectionState::Idle;

        match outcome {
            Ok((model, insights, window)) => {
                self.writer.publish(model);
                let insight_score: f32 = insights.iter().map(|i| i.delta().abs()).sum();
                let record = ReflectionRecord {
                    id: self.next_id,
                    timestamp: now_secs(),
                    trigger,
                    window,
                    insights,
                    insight_score,
                };
                self.next_id += 1;
                tracing::info!(
                    record = record.id,
                    trigger = record.trigger.label(),
                    window,
                    insight_score,
                    "reflection complete"
                );
                self.records.push(record);
                self.records.last()
            }
            Err(e) => {
                tracing::error!(error = %e, trigger = trigger.label(), "reflection failed, self-model unchanged");
                self.errors.push(ErrorEvent {
                    timestamp: now_secs(),
                    trigger,
                    message: e.to_string(),
                });
                None
            }
        }
    }

    fn compute(
        &self,
        observations: &[Observation],
    ) -> ReflectionResult<(SelfModel, Vec<Insight>, usize)> {
        let start = observations.len().saturating_sub(self.config.window);
        let window = &observations[start..];
        for obs in window {
            obs.validate()
                .map_err(|reason| ReflectionError::MalformedObservation {
                    observation_id: obs.id,
                    reason,
                })?;
        }

        // (successes, total) per tool and per drive.
        let mut tools: HashMap<&str, (u32, u32)> = HashMap::new();
        let mut drives: HashMap<DriveKind, (u32, u32)> = HashMap::new();
        for obs in window {
            for trace in &obs.tools {
                let e = tools.entry(trace.tool.as_str()).or_default();
                e.0 += trace.succeeded as u32;
                e.1 += 1;
            }
            if let Some(drive) = obs.drive {
                let e = drives.entry(drive).or_default();
                e.0 += (obs.outcome == Outcome::Completed) as u32;
                e.1 += 1;
            }
        }

        let old = self.writer.snapshot();
        let mut model = SelfModel::clone(&old);
        let alpha = self.config.alpha;
        let mut insights = Vec::new();

        let mut tool_names: Vec<&&str> = tools.keys().collect();
        tool_names.sort();
        for name in tool_names {
            let (ok, total) = tools[*name];
            let before = old.confidence(name);
            let after = ema_update(before, ok as f32 / total as f32, alpha);
            model.set_confidence(*name, after);
            if after != before {
                insights.push(Insight {
                    subject: format!("capability:{name}"),
                    before,
                    after,
                    evidence: total as usize,
                });
            }
        }

        for drive in DriveKind::ALL {
            let Some(&(ok, total)) = drives.get(&drive) else {
                continue;
            };
            let before = old.drive_weight(drive);
            let after = ema_update(before, ok as f32 / total as f32, alpha);
            model.set_drive_weight(drive, after);
            if after != before {
                insights.push(Insight {
                    subject: format!("drive:{drive}"),
                    before,
                    after,
                    evidence: total as usize,
                });
            }
        }

        Ok((model, insights, window.len()))
    }
}
