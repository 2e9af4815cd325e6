//! Exploration scheduler: keeps the internal candidate set stocked and
//! turns accumulated insight into purpose.
//!
//! Each free internal slot is filled with a novelty goal with probability `p`
//! (when an unused, untargeted capability exists) and with a drive proposal
//! otherwise. The drive is drawn by weight from the self-model, so drives the
//! agent has found rewarding get more turns.

use miette::Diagnostic;
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::capability::CapabilityRegistry;
use super::drives::{self, DriveKind};
use super::goal::GoalId;
use super::goal_manager::GoalManager;
use super::metacognition::{ReflectionRecord, SelfModel};

#[derive(Debug, Error, Diagnostic)]
pub enum ExplorationError {
    #[error("exploration fraction must lie strictly between 0 and 1, got {value}")]
    #[diagnostic(
        code(evo::exploration::fraction),
        help("Set `exploration.exploration_fraction` to a value such as 0.2.")
    )]
    InvalidFraction { value: f32 },
}

pub type ExplorationResult<T> = std::result::Result<T, ExplorationError>;

/// Exploration scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    /// Chance a free slot gets a novelty goal (default: 0.2).
    pub exploration_fraction: f32,
    /// Accumulated insight needed before a purpose goal (default: 1.5).
    pub synthesis_threshold: f32,
    /// Ticks between purpose checks (default: 5).
    pub synthesis_check_interval: u64,
    /// Urgency of purpose goals (default: 0.3).
    pub purpose_urgency: f32,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    pub purpose_statement: String,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            exploration_fraction: 0.2,
            synthesis_threshold: 1.5,
            synthesis_check_interval: 5,
            purpose_urgency: 0.3,
            seed: None,
            purpose_statement:
                "I exist to learn, improve, and find meaning through continuous exploration."
                    .into(),
        }
    }
}

impl ExplorationConfig {
    pub fn validate(&self) -> ExplorationResult<()> {
        let p = self.exploration_fraction;
        if !(p > 0.0 && p < 1.0) {
            return Err(ExplorationError::InvalidFraction { value: p });
        }
        Ok(())
    }
}

pub struct ExplorationScheduler {
    config: ExplorationConfig,
    rng: StdRng,
    insight_accumulator: f32,
    absorbed: usize,
    ticks: u64,
}

impl std::fmt::Debug for ExplorationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplorationScheduler")
            .field("exploration_fraction", &self.config.exploration_fraction)
            .field("insight_accumulator", &self.insight_accumulator)
            .field("absorbed", &self.absorbed)
            .field("ticks", &self.ticks)
            .finish()
    }
}

impl ExplorationScheduler {
    pub fn new(config: ExplorationConfig) -> ExplorationResult<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            rng,
            insight_accumulator: 0.0,
            absorbed: 0,
            ticks: 0,
        })
    }

    pub fn config(&self) -> &ExplorationConfig {
        &self.config
    }

    pub fn insight_accumulator(&self) -> f32 {
        self.insight_accumulator
    }

    /// Fill free internal slots. Returns the ids of the goals added.
    pub fn refresh(
        &mut self,
        goals: &mut GoalManager,
        registry: &dyn CapabilityRegistry,
        model: &SelfModel,
    ) -> Vec<GoalId> {
        let slots = goals.free_internal_slots();
        if slots == 0 {
            return Vec::new();
        }
        let tools: Vec<String> = registry
            .available_tools()
            .into_iter()
            .map(|s| s.name)
            .collect();
        let unused = registry.report_unused();
        let mut targeted = goals.novelty_targets();

        let mut added = Vec::new();
        for _ in 0..slots {
            let novelty = if self.rng.gen_bool(f64::from(self.config.exploration_fraction)) {
                unused.iter().find(|c| !targeted.contains(*c)).cloned()
            } else {
                None
            };
            let id = match novelty {
                Some(capability) => {
                    let id = goals.propose_novelty(&capability);
                    targeted.insert(capability);
                    id
                }
                None => {
                    let drive = self.pick_drive(model);
                    goals.propose_internal_goal(drive, &tools)
                }
            };
            added.extend(id);
        }
        if !added.is_empty() {
            tracing::debug!(count = added.len(), "exploration injected internal goals");
        }
        added
    }

    /// Weighted draw over drive weights, uniform when every weight is zero.
    fn pick_drive(&mut self, model: &SelfModel) -> DriveKind {
        let weights: Vec<f32> = DriveKind::ALL
            .iter()
            .map(|&d| model.drive_weight(d))
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => DriveKind::ALL[dist.sample(&mut self.rng)],
            Err(_) => DriveKind::ALL[self.rng.gen_range(0..DriveKind::ALL.len())],
        }
    }

    /// Add the insight scores of records not yet seen. `records` is the
    /// engine's full append-only history.
    pub fn absorb(&mut self, records: &[ReflectionRecord]) {
        let fresh = records.get(self.absorbed..).unwrap_or(&[]);
        for record in fresh {
            if record.insight_score.is_finite() {
                self.insight_accumulator += record.insight_score.max(0.0);
            }
        }
        self.absorbed = records.len();
    }

    /// Count a tick; on check ticks, emit a purpose goal if enough insight
    /// has accumulated.
    pub fn on_tick(
        &mut self,
        goals: &mut GoalManager,
        model: &SelfModel,
        tools: &[String],
    ) -> Option<GoalId> {
        self.ticks += 1;
        let interval = self.config.synthesis_check_interval;
        if interval == 0 || self.ticks % interval != 0 {
            return None;
        }
        if self.insight_accumulator < self.config.synthesis_threshold {
            return None;
        }
        let capabilities = drives::propose(DriveKind::Meaning, tools, model).capabilities;
        let id = goals.propose_purpose(
            &self.config.purpose_statement,
            capabilities,
            self.config.purpose_urgency,
        );
        tracing::info!(
            goal = %id,
            insight = self.insight_accumulator,
            "insight threshold crossed, purpose synthesized"
        );
        self.insight_accumulator = 0.0;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::agent::capability::CapabilityTable;
    use crate::agent::feedback::ReflectionTrigger;
    use crate::agent::goal::GoalKind;
    use crate::agent::goal_manager::GoalManagerConfig;
    use crate::agent::metacognition::self_model_channel;
    use crate::agent::tool::{Tool, ToolInput, ToolOutput, ToolResult, ToolSignature};

    struct Noop(&'static str);

    impl Tool for Noop {
        fn signature(&self) -> ToolSignature {
            ToolSignature {
                name: self.0.into(),
                description: "does nothing".into(),
                parameters: vec![],
            }
        }

        fn execute(&self, _input: &ToolInput) -> ToolResult<ToolOutput> {
            Ok(ToolOutput::ok("noop"))
        }
    }

    fn config(p: f32) -> ExplorationConfig {
        ExplorationConfig {
            exploration_fraction: p,
            seed: Some(7),
            ..Default::default()
        }
    }

    fn goals(max: usize) -> GoalManager {
        let (_writer, reader) = self_model_channel(SelfModel::default());
        GoalManager::new(
            GoalManagerConfig {
                max_internal_goals: max,
                ..Default::default()
            },
            reader,
        )
    }

    fn record(score: f32) -> ReflectionRecord {
        ReflectionRecord {
            id: 0,
            timestamp: 0,
            trigger: ReflectionTrigger::Periodic,
            window: 0,
            insights: vec![],
            insight_score: score,
        }
    }

    #[test]
    fn fraction_must_be_open_interval() {
        for bad in [0.0, 1.0, -0.5, f32::NAN] {
            assert!(ExplorationScheduler::new(config(bad)).is_err());
        }
        assert!(ExplorationScheduler::new(config(0.5)).is_ok());
    }

    #[test]
    fn refresh_fills_free_slots_with_novelty() {
        let registry = CapabilityTable::new();
        registry.register_tool(Arc::new(Noop("alpha"))).unwrap();
        registry.register_tool(Arc::new(Noop("beta"))).unwrap();
        let mut gm = goals(2);
        let mut sched = ExplorationScheduler::new(config(0.999)).unwrap();

        let added = sched.refresh(&mut gm, &registry, &SelfModel::default());
        assert_eq!(added.len(), 2);
        assert_eq!(gm.free_internal_slots(), 0);
        let targets = gm.novelty_targets();
        assert!(targets.contains("alpha") && targets.contains("beta"));

        // Full: nothing more.
        assert!(sched.refresh(&mut gm, &registry, &SelfModel::default()).is_empty());
    }

    #[test]
    fn rare_exploration_falls_back_to_drives() {
        let registry = CapabilityTable::new();
        registry.register_tool(Arc::new(Noop("alpha"))).unwrap();
        let mut gm = goals(1);
        let mut sched = ExplorationScheduler::new(config(0.001)).unwrap();
        sched.refresh(&mut gm, &registry, &SelfModel::default());
        let goal = &gm.internal_goals()[0];
        assert_eq!(goal.kind, GoalKind::Task);
        assert!(goal.drive.is_some());
    }

    #[test]
    fn weighted_draw_follows_drive_weights() {
        let mut model = SelfModel::default();
        for d in DriveKind::ALL {
            model.set_drive_weight(d, 0.0);
        }
        model.set_drive_weight(DriveKind::Competence, 1.0);
        let mut sched = ExplorationScheduler::new(config(0.2)).unwrap();
        for _ in 0..50 {
            assert_eq!(sched.pick_drive(&model), DriveKind::Competence);
        }
    }

    #[test]
    fn all_zero_weights_still_pick_a_drive() {
        let mut model = SelfModel::default();
        for d in DriveKind::ALL {
            model.set_drive_weight(d, 0.0);
        }
        let mut sched = ExplorationScheduler::new(config(0.2)).unwrap();
        let drive = sched.pick_drive(&model);
        assert!(DriveKind::ALL.contains(&drive));
    }

    #[test]
    fn seeded_schedulers_agree() {
        let model = SelfModel::default();
        let mut a = ExplorationScheduler::new(config(0.2)).unwrap();
        let mut b = ExplorationScheduler::new(config(0.2)).unwrap();
        let da: Vec<_> = (0..20).map(|_| a.pick_drive(&model)).collect();
        let db: Vec<_> = (0..20).map(|_| b.pick_drive(&model)).collect();
        assert_eq!(da, db);
    }

    #[test]
    fn absorb_counts_each_record_once() {
        let mut sched = ExplorationScheduler::new(config(0.2)).unwrap();
        let mut records = vec![record(0.5), record(0.25)];
        sched.absorb(&records);
        sched.absorb(&records);
        assert!((sched.insight_accumulator() - 0.75).abs() < 1e-6);
        records.push(record(1.0));
        sched.absorb(&records);
        assert!((sched.insight_accumulator() - 1.75).abs() < 1e-6);
    }

    #[test]
    fn purpose_emitted_on_interval_when_threshold_met() {
        let mut gm = goals(8);
        let mut sched = ExplorationScheduler::new(ExplorationConfig {
            synthesis_check_interval: 2,
            synthesis_threshold: 1.0,
            ..config(0.2)
        })
        .unwrap();
        let model = SelfModel::default();
        sched.absorb(&[record(1.2)]);

        assert!(sched.on_tick(&mut gm, &model, &[]).is_none());
        let id = sched.on_tick(&mut gm, &model, &[]).unwrap();
        let goal = gm.get(id).unwrap();
        assert_eq!(goal.kind, GoalKind::PurposeSynthesis);
        assert!((goal.urgency - 0.3).abs() < 1e-6);
        assert_eq!(sched.insight_accumulator(), 0.0);

        // Reset: the next check emits nothing.
        sched.on_tick(&mut gm, &model, &[]);
        assert!(sched.on_tick(&mut gm, &model, &[]).is_none());
    }

    #[test]
    fn below_threshold_no_purpose() {
        let mut gm = goals(8);
        let mut sched = ExplorationScheduler::new(ExplorationConfig {
            synthesis_check_interval: 1,
            ..config(0.2)
        })
        .unwrap();
        sched.absorb(&[record(0.1)]);
        assert!(sched.on_tick(&mut gm, &SelfModel::default(), &[]).is_none());
        assert!(gm.purpose_goal().is_none());
    }
}
