//! The control loop: one tick wires every component together.
//!
//! A tick applies operator commands, polls perception, asks the arbiter for a
//! mode, runs the responsive and autonomous tracks, records every finished
//! goal, runs at most one reflection, feeds the exploration scheduler, and
//! emits a [`TickStatus`]. `tick` never fails: unclassified subsystem errors
//! degrade the agent into SafetyOverride instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::EvoConfig;
use crate::message::{ResultSummary, StatusSink, TickStatus};

use super::capability::CapabilityRegistry;
use super::error::{AgentError, AgentResult};
use super::executor::{ActionExecutor, ExecutionResult, ExecutorContext, PlanRun};
use super::exploration::ExplorationScheduler;
use super::feedback::FeedbackProcessor;
use super::goal::GoalId;
use super::goal_manager::GoalManager;
use super::memory::MemoryStore;
use super::metacognition::{ReflectionEngine, SelfModel, SelfModelReader, self_model_channel};
use super::mode::{ArbiterInput, Mode, ModeArbiter, SharedMode, Track};
use super::operator_channel::{OperatorChannel, OverrideCommand, OverrideHandle};
use super::perception::{InputSource, PerceptionGateway};
use super::plan::Planner;
use super::safety::SafetyMonitor;

/// Control loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlLoopConfig {
    /// Autonomous-track steps per tick (default: 1).
    pub autonomous_steps_per_tick: usize,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            autonomous_steps_per_tick: 1,
        }
    }
}

/// External collaborators handed to the loop at construction.
pub struct Collaborators {
    pub planner: Box<dyn Planner>,
    pub registry: Arc<dyn CapabilityRegistry>,
    pub memory: Arc<dyn MemoryStore>,
    pub perception: Box<dyn PerceptionGateway>,
    pub sink: Arc<dyn StatusSink>,
    /// Self-model to start from; a fresh one is built from config otherwise.
    pub initial_model: Option<SelfModel>,
}

pub struct ControlLoop {
    config: ControlLoopConfig,
    tick: u64,
    mode: SharedMode,
    arbiter: ModeArbiter,
    goals: GoalManager,
    executor: ActionExecutor,
    safety: SafetyMonitor,
    feedback: FeedbackProcessor,
    reflection: ReflectionEngine,
    exploration: ExplorationScheduler,
    model: SelfModelReader,
    planner: Box<dyn Planner>,
    registry: Arc<dyn CapabilityRegistry>,
    perception: Box<dyn PerceptionGateway>,
    operator: OperatorChannel,
    sink: Arc<dyn StatusSink>,
    autonomous: Option<PlanRun>,
    last_user_input: Instant,
    paused: bool,
    history: Vec<ResultSummary>,
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("tick", &self.tick)
            .field("mode", &self.mode.load())
            .field("paused", &self.paused)
            .field("goals", &self.goals)
            .field("autonomous", &self.autonomous.as_ref().map(|r| r.goal().id))
            .finish_non_exhaustive()
    }
}

impl ControlLoop {
    pub fn new(config: &EvoConfig, collaborators: Collaborators) -> AgentResult<Self> {
        let Collaborators {
            planner,
            registry,
            memory,
            perception,
            sink,
            initial_model,
        } = collaborators;

        let exploration = ExplorationScheduler::new(config.exploration.clone())?;
        let model =
            initial_model.unwrap_or_else(|| SelfModel::with_scoring(config.goals.scoring));
        let (writer, reader) = self_model_channel(model);
        let mode = SharedMode::new(Mode::Responsive);

        Ok(Self {
            config: config.control.clone(),
            tick: 0,
            arbiter: ModeArbiter::new(&config.arbiter),
            goals: GoalManager::new(config.goals.clone(), reader.clone()),
            executor: ActionExecutor::new(config.executor.retry_policy()),
            safety: SafetyMonitor::new(&config.safety, mode.clone()),
            feedback: FeedbackProcessor::new(config.feedback.clone(), memory),
            reflection: ReflectionEngine::new(config.reflection.clone(), writer),
            exploration,
            model: reader,
            mode,
            planner,
            registry,
            perception,
            operator: OperatorChannel::new(),
            sink,
            autonomous: None,
            last_user_input: Instant::now(),
            paused: false,
            history: Vec::new(),
        })
    }

    /// Replace the executor's backoff sleep.
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.executor = self.executor.clone().with_sleep(sleep);
        self
    }

    // -- accessors -------------------------------------------------------

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn mode(&self) -> Mode {
        self.mode.load()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn goals(&self) -> &GoalManager {
        &self.goals
    }

    /// Direct access for seeding candidates between ticks.
    pub fn goals_mut(&mut self) -> &mut GoalManager {
        &mut self.goals
    }

    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    /// Operator access to limits and constraints between ticks.
    pub fn safety_mut(&mut self) -> &mut SafetyMonitor {
        &mut self.safety
    }

    pub fn feedback(&self) -> &FeedbackProcessor {
        &self.feedback
    }

    pub fn reflection(&self) -> &ReflectionEngine {
        &self.reflection
    }

    pub fn exploration(&self) -> &ExplorationScheduler {
        &self.exploration
    }

    pub fn self_model(&self) -> Arc<SelfModel> {
        self.model.snapshot()
    }

    pub fn model_reader(&self) -> SelfModelReader {
        self.model.clone()
    }

    pub fn autonomous_run(&self) -> Option<&PlanRun> {
        self.autonomous.as_ref()
    }

    /// Summaries of every goal finished so far, oldest first.
    pub fn history(&self) -> &[ResultSummary] {
        &self.history
    }

    pub fn operator_handle(&self) -> OverrideHandle {
        self.operator.handle()
    }

    /// Queue a user goal directly, bypassing perception.
    pub fn submit_goal(&mut self, description: &str, capabilities: Vec<String>) -> AgentResult<GoalId> {
        self.last_user_input = Instant::now();
        self.goals.submit_external(description, capabilities)
    }

    // -- the tick --------------------------------------------------------

    /// Run `ticks` ticks and return their status records.
    pub fn run(&mut self, ticks: u64) -> Vec<TickStatus> {
        (0..ticks).map(|_| self.tick()).collect()
    }

    pub fn tick(&mut self) -> TickStatus {
        self.tick += 1;
        let span = tracing::debug_span!("tick", n = self.tick);
        let _enter = span.enter();

        self.apply_operator_commands();
        let pending_user_input = self.perceive();

        let input = ArbiterInput {
            pending_user_input,
            idle_duration: self.last_user_input.elapsed(),
            active_hard_violation: self.safety.override_active(),
            autonomous_in_flight: self.autonomous.is_some(),
        };
        let mode = self.arbiter.select_mode(&input);
        self.mode.store(mode);

        let mut finished = Vec::new();
        let mut errors = Vec::new();
        let mut active_goal_id = None;
        if mode == Mode::SafetyOverride {
            if let Some(mut run) = self.autonomous.take() {
                run.cancel("safety override active");
                finished.push(run.into_result());
            }
        } else if !self.paused {
            active_goal_id = self.progress(mode, &mut finished, &mut errors);
        }

        let last_result = self.record(finished, &mut errors);
        if let Some(error) = errors.into_iter().next() {
            self.degrade(error);
        }
        self.reflect();
        self.explore();

        let status = TickStatus {
            tick: self.tick,
            mode: self.mode.load(),
            active_goal_id,
            autonomous_goal_id: self.autonomous.as_ref().map(|r| r.goal().id),
            last_result,
            paused: self.paused,
        };
        self.sink.emit(&status);
        status
    }

    fn apply_operator_commands(&mut self) {
        for command in self.operator.drain() {
            tracing::info!(command = %command, "applying operator command");
            match command {
                OverrideCommand::ClearOverride => match self.safety.clear_override() {
                    Ok(()) => self.arbiter.force_responsive(),
                    Err(e) => tracing::warn!(error = %e, "override not cleared"),
                },
                OverrideCommand::Pause => self.paused = true,
                OverrideCommand::Resume => self.paused = false,
                OverrideCommand::Block { action } => self.safety.block(action),
                OverrideCommand::Unblock { action } => {
                    if !self.safety.unblock(&action) {
                        tracing::warn!(action = %action, "unblock for an action that was not blocked");
                    }
                }
                OverrideCommand::ResetUsage => self.safety.reset_usage(),
            }
        }
    }

    /// Drain perception. Returns whether user goals are waiting.
    fn perceive(&mut self) -> bool {
        for event in self.perception.poll() {
            match event.source {
                InputSource::Safety => self.safety.raise_alert(event.payload),
                InputSource::User => {
                    self.last_user_input = Instant::now();
                    if let Err(e) = self.goals.submit_external(&event.payload, event.hints) {
                        tracing::warn!(error = %e, "user input rejected");
                    }
                }
                source => {
                    tracing::debug!(source = %source, payload = %event.payload, "input ignored")
                }
            }
        }
        self.goals.external_len() > 0
    }

    /// Select and run goals for `mode`. Returns the responsive goal, if any.
    fn progress(
        &mut self,
        mode: Mode,
        finished: &mut Vec<ExecutionResult>,
        errors: &mut Vec<AgentError>,
    ) -> Option<GoalId> {
        let model = self.model.snapshot();
        self.exploration
            .refresh(&mut self.goals, self.registry.as_ref(), &model);
        self.goals.evaluate_all();

        let mut ctx = ExecutorContext::new(
            &mut self.safety,
            self.registry.as_ref(),
            self.planner.as_ref(),
        );

        if mode.runs_autonomous_track() && self.autonomous.is_none() {
            if let Some(goal) = self.goals.select_for_track(mode, Track::Autonomous) {
                if let Err(e) = self.goals.mark_executing(goal.id) {
                    errors.push(e);
                }
                match self.executor.begin(goal, Track::Autonomous, &mut ctx) {
                    Ok(run) => self.autonomous = Some(run),
                    Err(result) => finished.push(result),
                }
            }
        }

        let mut budget = self.config.autonomous_steps_per_tick;
        let mut active = None;
        if mode.runs_responsive_track() {
            if let Some(goal) = self.goals.select_for_track(mode, Track::Responsive) {
                active = Some(goal.id);
                if let Err(e) = self.goals.mark_executing(goal.id) {
                    errors.push(e);
                }
                match self.executor.begin(goal, Track::Responsive, &mut ctx) {
                    Err(result) => finished.push(result),
                    Ok(mut run) => {
                        loop {
                            let more = self.executor.step(&mut run, &mut ctx);
                            // Interleave: one autonomous step per responsive step.
                            if mode == Mode::Hybrid && budget > 0 {
                                if let Some(auto) = self.autonomous.as_mut() {
                                    self.executor.step(auto, &mut ctx);
                                    budget -= 1;
                                }
                            }
                            if !more {
                                break;
                            }
                        }
                        finished.push(run.into_result());
                    }
                }
            }
        }

        if mode.runs_autonomous_track() {
            while budget > 0 {
                let Some(auto) = self.autonomous.as_mut() else {
                    break;
                };
                budget -= 1;
                if !self.executor.step(auto, &mut ctx) {
                    break;
                }
            }
        }

        // An override raised during this tick stops autonomous work now.
        if self.mode.load() == Mode::SafetyOverride {
            if let Some(run) = self.autonomous.as_mut() {
                run.cancel("safety override entered");
            }
        }
        let done = self
            .autonomous
            .as_ref()
            .map(|r| r.is_finished())
            .unwrap_or(false);
        if done {
            if let Some(run) = self.autonomous.take() {
                finished.push(run.into_result());
            }
        }
        active
    }

    /// Record finished goals: observation first, then retirement.
    fn record(
        &mut self,
        finished: Vec<ExecutionResult>,
        errors: &mut Vec<AgentError>,
    ) -> Option<ResultSummary> {
        let mut last = None;
        for result in finished {
            let processed = self.feedback.process(&result, self.tick);
            if let Some(e) = processed.store_error {
                errors.push(e.into());
            }
            if let Err(e) = self.goals.retire(&processed.observation) {
                errors.push(e);
            }
            self.safety.end_goal(result.goal.id);

            let summary = ResultSummary::from(&result);
            tracing::info!(
                goal = %summary.goal_id,
                track = summary.track.label(),
                status = %summary.status,
                "goal finished"
            );
            self.history.push(summary.clone());
            last = Some(summary);
        }
        last
    }

    fn degrade(&mut self, error: AgentError) {
        tracing::error!(error = %error, "unrecoverable subsystem error, entering safety override");
        self.safety.degrade(error.to_string());
        if let Some(mut run) = self.autonomous.take() {
            run.cancel("agent degraded");
            let result = run.into_result();
            let processed = self.feedback.process(&result, self.tick);
            if let Err(e) = self.goals.retire(&processed.observation) {
                tracing::error!(error = %e, "failed to retire goal cancelled by degradation");
            }
            self.safety.end_goal(result.goal.id);
            self.history.push(ResultSummary::from(&result));
        }
    }

    fn reflect(&mut self) {
        self.feedback.on_tick();
        let Some(trigger) = self.feedback.next_trigger() else {
            return;
        };
        let window = self.feedback.window();
        // Failures are recorded by the engine; the loop carries on either way.
        let _ = self.reflection.reflect(trigger, &window);
        self.feedback.mark_reflected();
    }

    fn explore(&mut self) {
        self.exploration.absorb(self.reflection.records());
        if self.mode.load() == Mode::SafetyOverride {
            return;
        }
        let tools: Vec<String> = self
            .registry
            .available_tools()
            .into_iter()
            .map(|s| s.name)
            .collect();
        let model = self.model.snapshot();
        self.exploration.on_tick(&mut self.goals, &model, &tools);
    }
}
