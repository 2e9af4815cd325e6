//! Feedback processor: turns execution results into observations.
//!
//! Every finished goal produces exactly one [`Observation`]. The processor
//! writes it to memory, keeps a bounded window for reflection, and queues
//! reflection triggers: periodic, failure streaks, and repeated patterns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::drives::DriveKind;
use super::executor::{ExecutionResult, ExecutionStatus, StepOutcome};
use super::goal::{GoalId, GoalOrigin, now_secs};
use super::memory::{EpisodicEntry, Fact, MemoryError, MemoryStore};

/// Feedback configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Confidence a fact must exceed to reach semantic memory (default: 0.6).
    pub fact_confidence_threshold: f32,
    /// Ticks between periodic reflections (default: 10).
    pub reflection_interval: u64,
    /// Consecutive failures of one goal that trigger reflection once
    /// exceeded (default: 2).
    pub failure_streak_threshold: u32,
    /// Times a pattern must repeat to trigger reflection (default: 3).
    pub pattern_repeat_threshold: u32,
    /// Observations kept for reflection (default: 50).
    pub observation_window: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            fact_confidence_threshold: 0.6,
            reflection_interval: 10,
            failure_streak_threshold: 2,
            pattern_repeat_threshold: 3,
            observation_window: 50,
        }
    }
}

/// Final outcome as seen by learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Failed,
    Abandoned,
}

impl Outcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

impl From<&ExecutionStatus> for Outcome {
    fn from(status: &ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Completed => Self::Completed,
            ExecutionStatus::Failed { .. } => Self::Failed,
            ExecutionStatus::Cancelled { .. } => Self::Abandoned,
        }
    }
}

/// A fact learned from one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedFact {
    pub key: String,
    pub value: String,
    pub confidence: f32,
}

/// Whether a tool worked in one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTrace {
    pub tool: String,
    pub succeeded: bool,
    pub attempts: u32,
}

/// Length of [`Observation::features`].
pub const FEATURE_DIM: usize = 6;

/// What the agent learned from one finished goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: u64,
    pub goal_id: GoalId,
    pub origin: GoalOrigin,
    pub drive: Option<DriveKind>,
    pub goal_kind: String,
    pub description: String,
    pub outcome: Outcome,
    pub summary: String,
    pub facts: Vec<LearnedFact>,
    pub pattern: Option<String>,
    pub tools: Vec<ToolTrace>,
    pub tick: u64,
    pub timestamp: u64,
    /// Fixed-length vector for episodic similarity.
    pub features: Vec<f32>,
}

impl Observation {
    /// Reject observations reflection cannot learn from.
    pub fn validate(&self) -> Result<(), String> {
        if self.features.len() != FEATURE_DIM {
            return Err(format!(
                "expected {FEATURE_DIM} features, found {}",
                self.features.len()
            ));
        }
        if let Some(bad) = self.features.iter().find(|f| !f.is_finite()) {
            return Err(format!("non-finite feature {bad}"));
        }
        if let Some(t) = self.tools.iter().find(|t| t.tool.is_empty()) {
            return Err(format!("tool trace with empty name ({} attempts)", t.attempts));
        }
        Ok(())
    }
}

/// What caused a reflection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    FailureStreak {
        description: String,
        drive: Option<DriveKind>,
        streak: u32,
    },
    RepeatedPattern {
        signature: String,
        count: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum ReflectionTrigger {
    Periodic,
    EventDriven(TriggerEvent),
}

impl ReflectionTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::EventDriven(TriggerEvent::FailureStreak { .. }) => "failure_streak",
            Self::EventDriven(TriggerEvent::RepeatedPattern { .. }) => "repeated_pattern",
        }
    }
}

/// Result of processing one execution.
#[derive(Debug)]
pub struct Processed {
    pub observation: Observation,
    /// First memory write that failed, if any. The observation is recorded
    /// in the window regardless.
    pub store_error: Option<MemoryError>,
}

/// Converts execution results into observations and reflection triggers.
pub struct FeedbackProcessor {
    config: FeedbackConfig,
    store: Arc<dyn MemoryStore>,
    window: VecDeque<Observation>,
    pattern_counts: HashMap<String, u32>,
    failure_streaks: HashMap<(String, Option<DriveKind>), u32>,
    triggers: VecDeque<ReflectionTrigger>,
    ticks_since_reflection: u64,
    next_id: u64,
    recorded: u64,
}

impl std::fmt::Debug for FeedbackProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedbackProcessor")
            .field("window", &self.window.len())
            .field("pending_triggers", &self.triggers.len())
            .field("recorded", &self.recorded)
            .finish()
    }
}

impl FeedbackProcessor {
    pub fn new(config: FeedbackConfig, store: Arc<dyn MemoryStore>) -> Self {
        Self {
            config,
            store,
            window: VecDeque::new(),
            pattern_counts: HashMap::new(),
            failure_streaks: HashMap::new(),
            triggers: VecDeque::new(),
            ticks_since_reflection: 0,
            next_id: 1,
            recorded: 0,
        }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Observations recorded since construction.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Recent observations, oldest first.
    pub fn window(&self) -> Vec<Observation> {
        self.window.iter().cloned().collect()
    }

    pub fn pending_triggers(&self) -> usize {
        self.triggers.len()
    }

    /// Record the outcome of `result`, observed on `tick`.
    pub fn process(&mut self, result: &ExecutionResult, tick: u64) -> Processed {
        let observation = self.observe(result, tick);
        self.track_streak(&observation);
        self.track_pattern(&observation);

        self.window.push_back(observation.clone());
        let mut rotated = false;
        while self.window.len() > self.config.observation_window.max(1) {
            self.window.pop_front();
            rotated = true;
        }
        if rotated {
            self.prune_trackers();
        }
        self.recorded += 1;

        let store_error = self.persist(&observation).err();
        if let Some(e) = &store_error {
            tracing::warn!(goal = %observation.goal_id, error = %e, "observation not persisted");
        }

        tracing::debug!(
            goal = %observation.goal_id,
            outcome = observation.outcome.label(),
            pattern = observation.pattern.as_deref().unwrap_or("-"),
            "observation recorded"
        );
        Processed {
            observation,
            store_error,
        }
    }

    /// Count a tick toward the periodic trigger.
    pub fn on_tick(&mut self) {
        self.ticks_since_reflection += 1;
        let interval = self.config.reflection_interval.max(1);
        if self.ticks_since_reflection >= interval
            && !self.triggers.contains(&ReflectionTrigger::Periodic)
        {
            self.triggers.push_back(ReflectionTrigger::Periodic);
        }
    }

    /// Take every queued trigger, event-driven ones first.
    pub fn drain_triggers(&mut self) -> Vec<ReflectionTrigger> {
        let mut all: Vec<ReflectionTrigger> = self.triggers.drain(..).collect();
        all.sort_by_key(|t| matches!(t, ReflectionTrigger::Periodic));
        all
    }

    /// Take the trigger for this tick's reflection.
    ///
    /// Event-driven triggers go first, oldest first; the rest stay queued for
    /// later ticks. A queued periodic trigger is satisfied by whichever
    /// reflection runs and is dropped.
    pub fn next_trigger(&mut self) -> Option<ReflectionTrigger> {
        let index = self
            .triggers
            .iter()
            .position(|t| !matches!(t, ReflectionTrigger::Periodic))
            .unwrap_or(0);
        let trigger = self.triggers.remove(index)?;
        let before = self.triggers.len();
        self.triggers
            .retain(|t| !matches!(t, ReflectionTrigger::Periodic));
        if self.triggers.len() < before {
            tracing::debug!(trigger = trigger.label(), "periodic reflection folded into this one");
        }
        if !self.triggers.is_empty() {
            tracing::debug!(
                deferred = ?self.triggers,
                "reflection triggers deferred to later ticks"
            );
        }
        Some(trigger)
    }

    /// Restart the periodic countdown after a reflection ran.
    pub fn mark_reflected(&mut self) {
        self.ticks_since_reflection = 0;
    }

    fn observe(&mut self, result: &ExecutionResult, tick: u64) -> Observation {
        let id = self.next_id;
        self.next_id += 1;
        let goal = &result.goal;
        let outcome = Outcome::from(&result.status);

        let tools: Vec<ToolTrace> = result
            .steps
            .iter()
            .filter(|s| s.attempts > 0)
            .map(|s| ToolTrace {
                tool: s.tool_name.clone(),
                succeeded: s.outcome.is_success(),
                attempts: s.attempts,
            })
            .collect();

        let facts = result
            .steps
            .iter()
            .filter_map(|s| match &s.outcome {
                StepOutcome::Success { .. } => Some(LearnedFact {
                    key: format!("tool:{}:reliable", s.tool_name),
                    value: format!("succeeded after {} attempt(s)", s.attempts),
                    confidence: 1.0 / s.attempts.max(1) as f32,
                }),
                StepOutcome::Failure { error, permanent } => Some(LearnedFact {
                    key: format!("tool:{}:unreliable", s.tool_name),
                    value: error.clone(),
                    confidence: if *permanent { 1.0 } else { 0.5 },
                }),
                StepOutcome::Denied { reason, .. } => Some(LearnedFact {
                    key: format!("action:{}:denied", s.tool_name),
                    value: reason.clone(),
                    confidence: 1.0,
                }),
                StepOutcome::Cancelled { .. } => None,
            })
            .collect();

        let pattern = if let Some(s) = result.steps_with("denied").next() {
            Some(format!("denied:{}", s.tool_name))
        } else if let Some(s) = result.steps_with("failure").next() {
            Some(format!("fail:{}", s.tool_name))
        } else if result.planning_error.is_some() {
            Some(format!("plan:{}", goal.kind.label()))
        } else {
            None
        };

        let summary = match &result.status {
            ExecutionStatus::Completed => format!(
                "{} completed in {} step(s)",
                goal.description,
                result.steps.len()
            ),
            ExecutionStatus::Failed { reason } | ExecutionStatus::Cancelled { reason } => {
                format!("{} {}: {}", goal.description, outcome.label(), reason)
            }
        };

        let features = features_of(result, outcome);

        Observation {
            id,
            goal_id: goal.id,
            origin: goal.origin,
            drive: goal.drive,
            goal_kind: goal.kind.label().to_string(),
            description: goal.description.clone(),
            outcome,
            summary,
            facts,
            pattern,
            tools,
            tick,
            timestamp: now_secs(),
            features,
        }
    }

    fn track_streak(&mut self, obs: &Observation) {
        let key = (obs.description.clone(), obs.drive);
        if obs.outcome != Outcome::Failed {
            self.failure_streaks.remove(&key);
            return;
        }
        let streak = self.failure_streaks.entry(key.clone()).or_insert(0);
        *streak += 1;
        if *streak > self.config.failure_streak_threshold {
            let streak = *streak;
            self.failure_streaks.remove(&key);
            self.triggers
                .push_back(ReflectionTrigger::EventDriven(TriggerEvent::FailureStreak {
                    description: key.0,
                    drive: key.1,
                    streak,
                }));
        }
    }

    fn track_pattern(&mut self, obs: &Observation) {
        let Some(signature) = &obs.pattern else {
            return;
        };
        let count = self.pattern_counts.entry(signature.clone()).or_insert(0);
        *count += 1;
        if *count >= self.config.pattern_repeat_threshold.max(1) {
            let count = *count;
            self.pattern_counts.remove(signature);
            self.triggers
                .push_back(ReflectionTrigger::EventDriven(TriggerEvent::RepeatedPattern {
                    signature: signature.clone(),
                    count,
                }));
        }
    }

    /// Write `obs` to every memory tier. Each write is attempted even after
    /// an earlier one fails; the first error is returned.
    fn persist(&self, obs: &Observation) -> Result<(), MemoryError> {
        let payload = serde_json::to_value(obs).map_err(|e| MemoryError::Serialization {
            message: e.to_string(),
        })?;
        let mut first_error = None;
        let mut keep = |result: Result<(), MemoryError>| {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        };

        keep(
            self.store
                .episodic_append(EpisodicEntry::new(
                    obs.summary.clone(),
                    obs.features.clone(),
                    payload.clone(),
                ))
                .map(|_| ()),
        );
        keep(self.store.working_set("last_observation", payload));
        keep(
            self.store
                .working_set("episodic_count", serde_json::json!(self.store.episodic_len())),
        );
        for fact in obs
            .facts
            .iter()
            .filter(|f| f.confidence > self.config.fact_confidence_threshold)
        {
            keep(self.store.semantic_upsert(Fact {
                key: fact.key.clone(),
                value: fact.value.clone(),
                confidence: fact.confidence,
            }));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Forget streaks and pattern counts with no observation left in the
    /// window.
    fn prune_trackers(&mut self) {
        let live_keys: HashSet<(&str, Option<DriveKind>)> = self
            .window
            .iter()
            .map(|o| (o.description.as_str(), o.drive))
            .collect();
        let live_patterns: HashSet<&str> = self
            .window
            .iter()
            .filter_map(|o| o.pattern.as_deref())
            .collect();
        self.failure_streaks
            .retain(|(description, drive), _| live_keys.contains(&(description.as_str(), *drive)));
        self.pattern_counts
            .retain(|signature, _| live_patterns.contains(signature.as_str()));
    }
}

fn features_of(result: &ExecutionResult, outcome: Outcome) -> Vec<f32> {
    let total = result.steps.len().max(1) as f32;
    let count = |label: &str| result.steps_with(label).count() as f32;
    let dispatched: Vec<u32> = result
        .steps
        .iter()
        .filter(|s| s.attempts > 0)
        .map(|s| s.attempts)
        .collect();
    let mean_attempts = if dispatched.is_empty() {
        0.0
    } else {
        dispatched.iter().sum::<u32>() as f32 / dispatched.len() as f32
    };
    vec![
        (outcome == Outcome::Completed) as u8 as f32,
        (outcome == Outcome::Failed) as u8 as f32,
        (outcome == Outcome::Abandoned) as u8 as f32,
        count("success") / total,
        count("denied") / total,
        // Squash mean attempts into [0, 1).
        1.0 - 1.0 / (1.0 + mean_attempts),
    ]
}
