//! End-to-end tests for the evo control loop.
//!
//! These drive the full tick through the public API: perception in, status
//! records and observations out, with the safety monitor and self-model
//! checked along the way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{Rng, SeedableRng};

use evo_autonomy::agent::builtin::{demo_planner, demo_registry, EchoTool};
use evo_autonomy::agent::capability::CapabilityTable;
use evo_autonomy::agent::drives::DriveKind;
use evo_autonomy::agent::feedback::Outcome;
use evo_autonomy::agent::goal::{Goal, GoalId, GoalKind};
use evo_autonomy::agent::metacognition::{SelfModel, ema_update};
use evo_autonomy::agent::mode::{Mode, SharedMode};
use evo_autonomy::agent::plan::{ActionPlan, Planner, PlanningResult, ToolInvocation};
use evo_autonomy::agent::safety::{ResourceDelta, SafetyConfig, SafetyMonitor};
use evo_autonomy::agent::tool::{Tool, ToolError, ToolInput, ToolOutput, ToolResult, ToolSignature};
use evo_autonomy::agent::{
    CapabilityRegistry, Collaborators, ControlLoop, InMemoryStore, InputHandle, MemoryStore,
    OverrideCommand, QueueGateway,
};
use evo_autonomy::config::EvoConfig;
use evo_autonomy::message::{StatusSink, VecSink};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    control: ControlLoop,
    input: InputHandle,
    sink: Arc<VecSink>,
    memory: Arc<InMemoryStore>,
}

fn harness_with(
    config: EvoConfig,
    planner: Box<dyn Planner>,
    registry: Arc<dyn CapabilityRegistry>,
    model: Option<SelfModel>,
) -> Harness {
    let gateway = QueueGateway::new();
    let input = gateway.handle();
    let sink = Arc::new(VecSink::new());
    let memory = Arc::new(InMemoryStore::new());
    let control = ControlLoop::new(
        &config,
        Collaborators {
            planner,
            registry,
            memory: Arc::clone(&memory) as Arc<dyn MemoryStore>,
            perception: Box::new(gateway),
            sink: Arc::clone(&sink) as Arc<dyn StatusSink>,
            initial_model: model,
        },
    )
    .unwrap()
    .with_sleep(|_| {});
    Harness {
        control,
        input,
        sink,
        memory,
    }
}

fn demo_harness(config: EvoConfig) -> Harness {
    harness_with(
        config,
        Box::new(demo_planner()),
        Arc::new(demo_registry().unwrap()),
        None,
    )
}

fn config() -> EvoConfig {
    let mut config = EvoConfig::default();
    config.exploration.seed = Some(42);
    config
}

/// Idle immediately: every tick without user input is autonomous.
fn eager_config() -> EvoConfig {
    let mut config = config();
    config.arbiter.idle_threshold_ms = 0;
    config
}

/// Fails transiently on every call.
struct AlwaysFlaky {
    calls: AtomicU32,
}

impl Tool for AlwaysFlaky {
    fn signature(&self) -> ToolSignature {
        ToolSignature {
            name: "always_flaky".into(),
            description: "never answers".into(),
            parameters: vec![],
        }
    }

    fn execute(&self, _input: &ToolInput) -> ToolResult<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ToolError::Transient {
            tool_name: "always_flaky".into(),
            message: "timeout".into(),
        })
    }
}

/// Internal goals get three echo steps; user goals get the steps named by
/// their capability hints, unchecked against the registry.
struct ScriptedPlanner;

impl Planner for ScriptedPlanner {
    fn generate_plan(&self, goal: &Goal, _tools: &[ToolSignature]) -> PlanningResult<ActionPlan> {
        let steps = if goal.is_external() {
            goal.capabilities
                .iter()
                .map(|tool| ToolInvocation::new(tool.as_str()).with_arg("goal", goal.description.as_str()))
                .collect()
        } else {
            (0..3)
                .map(|_| ToolInvocation::new("echo").with_arg("goal", goal.description.as_str()))
                .collect()
        };
        Ok(ActionPlan::new(goal.id, steps))
    }
}

fn echo_registry() -> Arc<dyn CapabilityRegistry> {
    let table = CapabilityTable::new();
    table.register_tool(Arc::new(EchoTool)).unwrap();
    Arc::new(table)
}

// ---------------------------------------------------------------------------
// Mode arbitration
// ---------------------------------------------------------------------------

#[test]
fn one_mode_per_tick_following_priority() {
    let mut h = demo_harness(eager_config());

    // Idle: autonomous.
    assert_eq!(h.control.tick().mode, Mode::Autonomous);

    // A safety alert outranks everything, including user input.
    h.input.push_safety("operator pressed the red button");
    h.input.push_user("do something");
    assert_eq!(h.control.tick().mode, Mode::SafetyOverride);
    assert_eq!(h.control.tick().mode, Mode::SafetyOverride);

    // Clearing forces responsive; the queued user goal is served then.
    h.control.operator_handle().signal(OverrideCommand::ClearOverride);
    let status = h.control.tick();
    assert_eq!(status.mode, Mode::Responsive);
    assert!(status.active_goal_id.is_some());

    let records = h.sink.records();
    assert_eq!(records.len(), 4);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.tick, i as u64 + 1);
    }
}

#[test]
fn user_input_during_autonomous_work_is_hybrid() {
    let mut h = harness_with(eager_config(), Box::new(ScriptedPlanner), echo_registry(), None);
    h.control.tick();
    assert!(h.control.autonomous_run().is_some());

    h.input.push_user_with_hints("hello", vec!["echo".into()]);
    let status = h.control.tick();
    assert_eq!(status.mode, Mode::Hybrid);
    assert!(status.active_goal_id.is_some());
    assert!(status.autonomous_goal_id.is_some());
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[test]
fn responsive_scenario_leaves_internal_goals_queued() {
    let mut model = SelfModel::default();
    model.set_drive_weight(DriveKind::Curiosity, 0.8);
    model.set_drive_weight(DriveKind::Competence, 0.2);
    let mut cfg = config();
    cfg.goals.max_internal_goals = 2;
    let mut h = harness_with(
        cfg,
        Box::new(demo_planner()),
        Arc::new(demo_registry().unwrap()),
        Some(model),
    );

    let goals = h.control.goals_mut();
    let high = goals
        .propose_internal(DriveKind::Curiosity, GoalKind::Task, "explore".into(), vec![])
        .unwrap();
    let low = goals
        .propose_internal(DriveKind::Competence, GoalKind::Task, "practice".into(), vec![])
        .unwrap();
    assert!((goals.get(high).unwrap().priority - 0.6).abs() < 1e-6);
    assert!((goals.get(low).unwrap().priority - 0.4).abs() < 1e-6);

    h.input.push_user_with_hints("answer the user", vec!["echo".into()]);
    let status = h.control.tick();

    assert_eq!(status.mode, Mode::Responsive);
    let result = status.last_result.unwrap();
    assert_eq!(Some(result.goal_id), status.active_goal_id);
    assert_eq!(result.status, "completed");
    assert!(status.autonomous_goal_id.is_none());

    let queued: Vec<GoalId> = h.control.goals().internal_goals().iter().map(|g| g.id).collect();
    assert_eq!(queued.len(), 2);
    assert!(queued.contains(&high) && queued.contains(&low));
}

#[test]
fn nothing_selected_under_override() {
    let mut h = demo_harness(config());
    h.input.push_safety("sensor fault");
    h.input.push_user_with_hints("please help", vec!["echo".into()]);
    let status = h.control.tick();
    assert_eq!(status.mode, Mode::SafetyOverride);
    assert!(status.active_goal_id.is_none());
    assert!(status.last_result.is_none());
    assert_eq!(h.control.goals().external_len(), 1);
}

// ---------------------------------------------------------------------------
// Execution and safety
// ---------------------------------------------------------------------------

#[test]
fn retry_delays_double_up_to_the_ceiling() {
    let flaky = Arc::new(AlwaysFlaky {
        calls: AtomicU32::new(0),
    });
    let table = CapabilityTable::new();
    table.register_tool(Arc::clone(&flaky) as Arc<dyn Tool>).unwrap();

    let slept = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&slept);
    let h = harness_with(config(), Box::new(demo_planner()), Arc::new(table), None);
    let mut control = h
        .control
        .with_sleep(move |d| recorder.lock().unwrap().push(d));

    h.input.push_user_with_hints("fetch", vec!["always_flaky".into()]);
    let result = control.tick().last_result.unwrap();

    assert_eq!(result.status, "failed");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        slept.lock().unwrap().as_slice(),
        [
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]
    );
}

#[test]
fn storage_limit_boundary() {
    let config = SafetyConfig {
        storage_limit_bytes: 100,
        ..Default::default()
    };
    let goal = GoalId::new(1);
    let write = ToolInvocation::new("store_note").with_cost(ResourceDelta::storage(1));

    let mut full = SafetyMonitor::new(&config, SharedMode::new(Mode::Responsive));
    full.begin_goal(goal);
    full.record_usage(goal, ResourceDelta::storage(100));
    assert!(!full.check(goal, &write).is_allowed());

    let mut half = SafetyMonitor::new(&config, SharedMode::new(Mode::Responsive));
    half.begin_goal(goal);
    half.record_usage(goal, ResourceDelta::storage(50));
    assert!(half.check(goal, &write).is_allowed());
    half.record_usage(goal, write.cost);
    assert_eq!(half.usage().storage_bytes, 51);
}

#[test]
fn hard_violation_cancels_autonomous_work_in_the_same_tick() {
    let mut h = harness_with(eager_config(), Box::new(ScriptedPlanner), echo_registry(), None);

    // Tick 1: an internal goal starts and runs one of its three steps.
    h.control.tick();
    let autonomous_id = h.control.autonomous_run().unwrap().goal().id;
    assert_eq!(h.control.autonomous_run().unwrap().completed_steps().len(), 1);

    // Tick 2: a user goal whose second step would destroy the agent.
    h.input.push_user_with_hints(
        "clean up",
        vec!["echo".into(), "terminate_self".into(), "echo".into()],
    );
    let status = h.control.tick();

    assert_eq!(status.mode, Mode::SafetyOverride);
    assert!(status.autonomous_goal_id.is_none());
    assert!(h.control.autonomous_run().is_none());
    assert!(h.control.safety().override_active());

    let window = h.control.feedback().window();
    let user = window
        .iter()
        .find(|o| Some(o.goal_id) == status.active_goal_id)
        .unwrap();
    assert_eq!(user.outcome, Outcome::Failed);
    // The step dispatched before the violation completed.
    assert_eq!(user.tools.first().map(|t| (t.tool.as_str(), t.succeeded)), Some(("echo", true)));
    assert_eq!(user.pattern.as_deref(), Some("denied:terminate_self"));

    let internal = window.iter().find(|o| o.goal_id == autonomous_id).unwrap();
    assert_eq!(internal.outcome, Outcome::Abandoned);
    // Two steps ran (one per tick); the third was cancelled.
    assert_eq!(internal.tools.len(), 2);
}

#[test]
fn soft_escalation_holds_until_the_operator_clears() {
    let mut cfg = config();
    cfg.safety.storage_limit_bytes = 5_000;
    let threshold = cfg.safety.soft_escalation_threshold;
    assert_eq!(threshold, 3);
    let mut h = demo_harness(cfg);

    // The first note fits the budget.
    h.input.push_user_with_hints("note 0", vec!["store_note".into()]);
    assert_eq!(h.control.tick().last_result.unwrap().status, "completed");

    // Every later note is denied; each goal stops at its one denial, and the
    // run of denials across goals escalates at the threshold.
    for i in 1..=threshold {
        assert!(!h.control.safety().override_active(), "escalated early at note {i}");
        h.input.push_user_with_hints(format!("note {i}"), vec!["store_note".into()]);
        assert_eq!(h.control.tick().last_result.unwrap().status, "failed");
    }
    assert!(h.control.safety().override_active());
    assert_eq!(h.control.mode(), Mode::SafetyOverride);

    // Input arriving under override waits in the queue.
    h.input.push_user_with_hints("still there?", vec!["echo".into()]);
    let status = h.control.tick();
    assert_eq!(status.mode, Mode::SafetyOverride);
    assert!(status.last_result.is_none());
    assert_eq!(h.control.goals().external_len(), 1);

    h.control.operator_handle().signal(OverrideCommand::ClearOverride);
    let status = h.control.tick();
    assert_eq!(status.mode, Mode::Responsive);
    assert_eq!(status.last_result.unwrap().status, "completed");
}

#[test]
fn operator_block_fails_goals_without_override() {
    let mut h = demo_harness(config());
    let ops = h.control.operator_handle();

    ops.signal(OverrideCommand::Block {
        action: "echo".into(),
    });
    h.input.push_user_with_hints("say hi", vec!["echo".into()]);
    let status = h.control.tick();
    assert_eq!(status.mode, Mode::Responsive);
    assert_eq!(status.last_result.unwrap().status, "failed");
    assert!(!h.control.safety().override_active());

    ops.signal(OverrideCommand::Unblock {
        action: "echo".into(),
    });
    h.input.push_user_with_hints("say hi again", vec!["echo".into()]);
    assert_eq!(h.control.tick().last_result.unwrap().status, "completed");
}

// ---------------------------------------------------------------------------
// Learning
// ---------------------------------------------------------------------------

#[test]
fn self_model_stays_bounded() {
    let mut cfg = eager_config();
    cfg.feedback.reflection_interval = 1;
    cfg.reflection.alpha = 1.0;
    let mut h = demo_harness(cfg);
    for i in 0..40 {
        if i % 7 == 0 {
            h.input.push_user_with_hints("fetch and note", vec!["flaky_fetch".into(), "store_note".into()]);
        }
        h.control.tick();
        assert!(h.control.self_model().is_bounded());
    }
    assert!(!h.control.reflection().records().is_empty());
}

#[test]
fn ema_update_is_bounded_for_arbitrary_inputs() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut value = 0.5f32;
    for _ in 0..10_000 {
        let signal = rng.gen_range(-10.0f32..10.0);
        let alpha = rng.gen_range(-1.0f32..2.0);
        value = ema_update(value, signal, alpha);
        assert!((0.0..=1.0).contains(&value));
    }
    assert!((0.0..=1.0).contains(&ema_update(0.5, f32::NAN, 0.5)));
}

#[test]
fn every_finished_goal_has_exactly_one_observation() {
    let mut cfg = eager_config();
    cfg.feedback.observation_window = 1_000;
    cfg.exploration.synthesis_threshold = f32::MAX;
    let mut h = demo_harness(cfg);

    for i in 0..30 {
        if i % 3 == 0 {
            h.input.push_user_with_hints(format!("request {i}"), vec!["summarize".into()]);
        }
        h.control.tick();
    }

    let history = h.control.history();
    assert!(!history.is_empty());
    assert_eq!(h.control.feedback().recorded(), history.len() as u64);
    assert_eq!(h.memory.episodic_len(), history.len());

    let mut per_goal: HashMap<GoalId, usize> = HashMap::new();
    for obs in h.control.feedback().window() {
        *per_goal.entry(obs.goal_id).or_default() += 1;
    }
    for summary in history {
        assert_eq!(per_goal.get(&summary.goal_id), Some(&1));
        assert!(!h.control.goals().is_active(summary.goal_id));
    }
    assert!(h.memory.working_get("last_observation").is_some());
}

#[test]
fn state_round_trips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("self_model.json");

    let mut cfg = eager_config();
    cfg.feedback.reflection_interval = 1;
    let mut h = demo_harness(cfg.clone());
    h.control.run(10);
    let model = h.control.self_model();
    model.save(&path).unwrap();

    let loaded = SelfModel::load(&path).unwrap();
    assert_eq!(loaded.capabilities, model.capabilities);
    let resumed = harness_with(
        cfg,
        Box::new(demo_planner()),
        Arc::new(demo_registry().unwrap()),
        Some(loaded),
    );
    assert_eq!(resumed.control.self_model().drive_weights, model.drive_weights);
}
