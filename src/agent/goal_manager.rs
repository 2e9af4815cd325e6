//! Goal manager: the external queue, the internal candidate set, scoring,
//! and selection.
//!
//! User goals wait in a FIFO and always outrank internal goals. Internal
//! goals compete on score. A selected goal stays in the active set until the
//! feedback processor's observation for it is presented to [`GoalManager::retire`].

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::drives::{self, DriveKind};
use super::error::{AgentError, AgentResult};
use super::feedback::Observation;
use super::goal::{Goal, GoalId, GoalKind, GoalStatus, clamp_unit, validate_description};
use super::metacognition::{ScoringWeights, SelfModelReader};
use super::mode::{Mode, Track};

/// Additive ranking bonus for user goals. Scores lie in [0, 1], so this puts
/// every external goal above every internal one.
pub const EXTERNAL_OFFSET: f32 = 1.0;

/// Goal manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalManagerConfig {
    /// Internal candidates kept at once, purpose goals excluded (default: 8).
    pub max_internal_goals: usize,
    /// Initial scoring weights for a fresh self-model.
    pub scoring: ScoringWeights,
}

impl Default for GoalManagerConfig {
    fn default() -> Self {
        Self {
            max_internal_goals: 8,
            scoring: ScoringWeights::default(),
        }
    }
}

pub struct GoalManager {
    config: GoalManagerConfig,
    model: SelfModelReader,
    external: VecDeque<Goal>,
    internal: Vec<Goal>,
    active: BTreeMap<GoalId, Goal>,
    superseded: HashSet<GoalId>,
    next_id: u64,
    next_sequence: u64,
}

impl std::fmt::Debug for GoalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalManager")
            .field("external", &self.external.len())
            .field("internal", &self.internal.len())
            .field("active", &self.active.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GoalManager {
    pub fn new(config: GoalManagerConfig, model: SelfModelReader) -> Self {
        Self {
            config,
            model,
            external: VecDeque::new(),
            internal: Vec::new(),
            active: BTreeMap::new(),
            superseded: HashSet::new(),
            next_id: 1,
            next_sequence: 0,
        }
    }

    pub fn config(&self) -> &GoalManagerConfig {
        &self.config
    }

    // -- intake ----------------------------------------------------------

    /// Queue a user goal.
    pub fn submit_external(
        &mut self,
        description: &str,
        capabilities: Vec<String>,
    ) -> AgentResult<GoalId> {
        validate_description(description)?;
        let (id, sequence) = self.allocate();
        let mut goal = Goal::external(id, sequence, description.trim(), capabilities);
        goal.priority = self.evaluate(&goal);
        tracing::debug!(goal = %id, description = %goal.description, "external goal queued");
        self.external.push_back(goal);
        Ok(id)
    }

    /// Ask `drive` for a proposal over `tools` and add it as a candidate.
    ///
    /// Returns `None` when the internal set is full or an identical
    /// candidate already exists.
    pub fn propose_internal_goal(&mut self, drive: DriveKind, tools: &[String]) -> Option<GoalId> {
        let model = self.model.snapshot();
        let proposal = drives::propose(drive, tools, &model);
        self.propose_internal(drive, GoalKind::Task, proposal.description, proposal.capabilities)
    }

    /// Add a novelty goal exercising an unused capability.
    pub fn propose_novelty(&mut self, capability: &str) -> Option<GoalId> {
        if self.novelty_targets().contains(capability) {
            return None;
        }
        self.propose_internal(
            DriveKind::Curiosity,
            GoalKind::Novelty {
                capability: capability.to_string(),
            },
            format!("explore unused capability {capability}"),
            vec![capability.to_string()],
        )
    }

    /// Add an internal candidate.
    pub fn propose_internal(
        &mut self,
        drive: DriveKind,
        kind: GoalKind,
        description: String,
        capabilities: Vec<String>,
    ) -> Option<GoalId> {
        if self.free_internal_slots() == 0 {
            return None;
        }
        let duplicate = self
            .internal
            .iter()
            .chain(self.active.values())
            .any(|g| g.drive == Some(drive) && g.description == description);
        if duplicate {
            return None;
        }
        let (id, sequence) = self.allocate();
        let mut goal = Goal::internal(id, sequence, drive, kind, description, capabilities);
        goal.priority = self.evaluate(&goal);
        tracing::debug!(goal = %id, drive = %drive, description = %goal.description, "internal goal proposed");
        self.internal.push(goal);
        Some(id)
    }

    /// Emit a persistent purpose goal, superseding any previous one.
    pub fn propose_purpose(
        &mut self,
        statement: &str,
        capabilities: Vec<String>,
        urgency: f32,
    ) -> GoalId {
        let previous: Vec<GoalId> = self
            .internal
            .iter()
            .filter(|g| g.is_persistent())
            .map(|g| g.id)
            .collect();
        for id in previous {
            // Queued purpose goals are dropped; running ones retire normally.
            let _ = self.abandon_internal(id, "superseded by a newer purpose");
        }
        let running: Vec<GoalId> = self
            .active
            .values()
            .filter(|g| g.is_persistent())
            .map(|g| g.id)
            .collect();
        self.superseded.extend(running);

        let (id, sequence) = self.allocate();
        let mut goal = Goal::internal(
            id,
            sequence,
            DriveKind::Meaning,
            GoalKind::PurposeSynthesis,
            statement,
            capabilities,
        )
        .with_urgency(urgency);
        goal.priority = self.evaluate(&goal);
        tracing::info!(goal = %id, statement, "purpose goal emitted");
        self.internal.push(goal);
        id
    }

    /// Drop a queued internal goal.
    pub fn abandon_internal(&mut self, id: GoalId, reason: &str) -> AgentResult<Goal> {
        let pos = self
            .internal
            .iter()
            .position(|g| g.id == id)
            .ok_or(AgentError::GoalNotFound { goal_id: id.get() })?;
        let mut goal = self.internal.remove(pos);
        goal.transition(GoalStatus::Abandoned {
            reason: reason.to_string(),
        })?;
        tracing::debug!(goal = %id, reason, "internal goal abandoned");
        Ok(goal)
    }

    // -- scoring ---------------------------------------------------------

    /// Score `goal` against the current self-model snapshot.
    pub fn evaluate(&self, goal: &Goal) -> f32 {
        let model = self.model.snapshot();
        let w = model.scoring;

        let feasibility = if goal.capabilities.is_empty() {
            1.0
        } else {
            goal.capabilities
                .iter()
                .map(|c| model.confidence(c))
                .sum::<f32>()
                / goal.capabilities.len() as f32
        };
        let learning_potential = match goal.kind {
            GoalKind::Novelty { .. } => 1.0,
            _ => 1.0 - feasibility,
        };
        let drive_alignment = goal.drive.map(|d| model.drive_weight(d)).unwrap_or(1.0);

        let weight_sum = w.feasibility + w.learning_potential + w.drive_alignment;
        let base = if weight_sum <= 0.0 {
            0.0
        } else {
            (w.feasibility * feasibility
                + w.learning_potential * learning_potential
                + w.drive_alignment * drive_alignment)
                / weight_sum
        };
        clamp_unit(base * goal.urgency)
    }

    /// Rescore every queued goal, moving proposals to `Evaluated`.
    pub fn evaluate_all(&mut self) {
        let scores: Vec<f32> = self
            .external
            .iter()
            .chain(self.internal.iter())
            .map(|g| self.evaluate(g))
            .collect();
        for (goal, score) in self
            .external
            .iter_mut()
            .chain(self.internal.iter_mut())
            .zip(scores)
        {
            goal.priority = score;
            if goal.status == GoalStatus::Proposed {
                goal.status = GoalStatus::Evaluated;
            }
        }
    }

    /// Ranking key: score plus the external offset.
    pub fn ranking_key(goal: &Goal) -> f32 {
        goal.priority + if goal.is_external() { EXTERNAL_OFFSET } else { 0.0 }
    }

    // -- selection -------------------------------------------------------

    /// Select the next goal for `mode`, external first. Nothing is selected
    /// under SafetyOverride.
    pub fn select_next(&mut self, mode: Mode) -> Option<Goal> {
        self.select_for_track(mode, Track::Responsive)
            .or_else(|| self.select_for_track(mode, Track::Autonomous))
    }

    /// Select for one track.
    ///
    /// The responsive track takes user goals only. The autonomous track takes
    /// internal goals in Hybrid mode, and either kind (user first) in
    /// Autonomous mode.
    pub fn select_for_track(&mut self, mode: Mode, track: Track) -> Option<Goal> {
        let goal = match (mode, track) {
            (Mode::SafetyOverride, _) => None,
            (Mode::Responsive | Mode::Hybrid, Track::Responsive) => self.external.pop_front(),
            (Mode::Hybrid, Track::Autonomous) => self.take_best_internal(),
            (Mode::Autonomous, Track::Autonomous) => self
                .external
                .pop_front()
                .or_else(|| self.take_best_internal()),
            (Mode::Autonomous, Track::Responsive) | (Mode::Responsive, Track::Autonomous) => None,
        }?;
        Some(self.activate(goal))
    }

    fn take_best_internal(&mut self) -> Option<Goal> {
        for i in 0..self.internal.len() {
            let score = self.evaluate(&self.internal[i]);
            self.internal[i].priority = score;
        }
        let best = self
            .internal
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                Self::ranking_key(a)
                    .total_cmp(&Self::ranking_key(b))
                    .then(b.sequence.cmp(&a.sequence))
            })
            .map(|(i, _)| i)?;
        Some(self.internal.remove(best))
    }

    fn activate(&mut self, mut goal: Goal) -> Goal {
        goal.priority = self.evaluate(&goal);
        goal.status = GoalStatus::Selected;
        tracing::debug!(
            goal = %goal.id,
            origin = goal.origin.label(),
            priority = goal.priority,
            "goal selected"
        );
        self.active.insert(goal.id, goal.clone());
        goal
    }

    /// Record that a selected goal started executing.
    pub fn mark_executing(&mut self, id: GoalId) -> AgentResult<()> {
        self.active
            .get_mut(&id)
            .ok_or(AgentError::GoalNotFound { goal_id: id.get() })?
            .transition(GoalStatus::Executing)
    }

    // -- retirement ------------------------------------------------------

    /// Remove a finished goal from the active set, given its observation.
    ///
    /// Persistent goals go back to the candidate set unless superseded and
    /// `None` is returned; otherwise the retired goal is returned.
    pub fn retire(&mut self, observation: &Observation) -> AgentResult<Option<Goal>> {
        let id = observation.goal_id;
        let persistent = self
            .active
            .get(&id)
            .ok_or(AgentError::GoalNotFound { goal_id: id.get() })?
            .is_persistent();
        if persistent && !self.superseded.remove(&id) {
            self.requeue_persistent(id)?;
            return Ok(None);
        }

        let mut goal = self
            .active
            .remove(&id)
            .ok_or(AgentError::GoalNotFound { goal_id: id.get() })?;
        if !goal.status.is_terminal() {
            goal.status = match observation.outcome {
                super::feedback::Outcome::Completed => GoalStatus::Completed,
                super::feedback::Outcome::Failed => GoalStatus::Failed {
                    reason: observation.summary.clone(),
                },
                super::feedback::Outcome::Abandoned => GoalStatus::Abandoned {
                    reason: observation.summary.clone(),
                },
            };
        }
        tracing::debug!(goal = %id, status = goal.status.label(), "goal retired");
        Ok(Some(goal))
    }

    /// Return an active persistent goal to the candidate set.
    pub fn requeue_persistent(&mut self, id: GoalId) -> AgentResult<()> {
        let goal = self
            .active
            .get(&id)
            .ok_or(AgentError::GoalNotFound { goal_id: id.get() })?;
        if !goal.is_persistent() {
            return Err(AgentError::InvalidGoal {
                message: format!("{id} is not persistent and cannot be requeued"),
            });
        }
        if let Some(mut goal) = self.active.remove(&id) {
            goal.status = GoalStatus::Evaluated;
            goal.priority = self.evaluate(&goal);
            self.internal.push(goal);
        }
        Ok(())
    }

    // -- inspection ------------------------------------------------------

    pub fn external_len(&self) -> usize {
        self.external.len()
    }

    pub fn internal_len(&self) -> usize {
        self.internal.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: GoalId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn external_goals(&self) -> impl Iterator<Item = &Goal> {
        self.external.iter()
    }

    pub fn internal_goals(&self) -> &[Goal] {
        &self.internal
    }

    /// Look a goal up wherever it currently lives.
    pub fn get(&self, id: GoalId) -> Option<&Goal> {
        self.active
            .get(&id)
            .or_else(|| self.external.iter().find(|g| g.id == id))
            .or_else(|| self.internal.iter().find(|g| g.id == id))
    }

    /// Open internal slots; purpose goals do not count against the limit.
    pub fn free_internal_slots(&self) -> usize {
        let used = self
            .internal
            .iter()
            .filter(|g| !g.is_persistent())
            .count();
        self.config.max_internal_goals.saturating_sub(used)
    }

    /// Capabilities already targeted by a queued or running novelty goal.
    pub fn novelty_targets(&self) -> HashSet<String> {
        self.internal
            .iter()
            .chain(self.active.values())
            .filter_map(|g| match &g.kind {
                GoalKind::Novelty { capability } => Some(capability.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn purpose_goal(&self) -> Option<&Goal> {
        self.internal
            .iter()
            .chain(self.active.values())
            .find(|g| g.is_persistent() && !self.superseded.contains(&g.id))
    }

    fn allocate(&mut self) -> (GoalId, u64) {
        let id = GoalId::new(self.next_id);
        let sequence = self.next_sequence;
        self.next_id += 1;
        self.next_sequence += 1;
        (id, sequence)
    }
}
