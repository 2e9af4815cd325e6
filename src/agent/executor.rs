//! Action executor: goal -> plan -> guarded tool invocations.
//!
//! Execution is split into [`ActionExecutor::begin`] (planning) and
//! [`ActionExecutor::step`] (one invocation, including its retries) so the
//! control loop can interleave two goals at step checkpoints. Before every
//! step and every retry the executor re-reads the shared mode; once
//! SafetyOverride is in force, remaining work is cancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::capability::CapabilityRegistry;
use super::goal::{Goal, GoalStatus};
use super::mode::{Mode, Track};
use super::plan::{ActionPlan, Planner, ToolInvocation};
use super::safety::{ConstraintKind, SafetyMonitor, Verdict};

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Retries after the initial dispatch of a transiently failing step.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }
}

impl ExecutorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Every delay this policy would wait through, in order.
    pub fn delays(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|a| self.delay_for(a)).collect()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How one plan step ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { output: String },
    Failure { error: String, permanent: bool },
    Denied { reason: String, kind: ConstraintKind },
    Cancelled { reason: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
            Self::Denied { .. } => "denied",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub tool_name: String,
    pub required: bool,
    pub outcome: StepOutcome,
    /// Dispatches made, including the first.
    pub attempts: u32,
    /// Delays waited before each retry.
    pub backoff: Vec<Duration>,
}

/// Aggregate outcome of a goal's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed { reason: String },
    Cancelled { reason: String },
}

impl ExecutionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// The goal status this outcome maps to.
    pub fn goal_status(&self) -> GoalStatus {
        match self {
            Self::Completed => GoalStatus::Completed,
            Self::Failed { reason } => GoalStatus::Failed {
                reason: reason.clone(),
            },
            Self::Cancelled { reason } => GoalStatus::Abandoned {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Snapshot of the goal as it ended.
    pub goal: Goal,
    pub track: Track,
    pub status: ExecutionStatus,
    pub steps: Vec<StepResult>,
    /// Outputs of successful steps, kept even when the goal failed.
    pub partial_outputs: Vec<String>,
    /// Set when the planner refused the goal.
    pub planning_error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn steps_with(&self, label: &str) -> impl Iterator<Item = &StepResult> {
        let label = label.to_string();
        self.steps.iter().filter(move |s| s.outcome.label() == label)
    }
}

// ---------------------------------------------------------------------------
// Plan runs
// ---------------------------------------------------------------------------

/// A plan in progress. Owned by whichever track is running it.
#[derive(Debug, Clone)]
pub struct PlanRun {
    goal: Goal,
    track: Track,
    plan: ActionPlan,
    cursor: usize,
    steps: Vec<StepResult>,
    outcome: Option<ExecutionStatus>,
}

impl PlanRun {
    pub fn goal(&self) -> &Goal {
        &self.goal
    }

    pub fn track(&self) -> Track {
        self.track
    }

    pub fn plan(&self) -> &ActionPlan {
        &self.plan
    }

    /// Steps resolved so far.
    pub fn completed_steps(&self) -> &[StepResult] {
        &self.steps
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Cancel every step not yet dispatched.
    pub fn cancel(&mut self, reason: &str) {
        if self.is_finished() {
            return;
        }
        self.cancel_remaining(reason);
        self.outcome = Some(ExecutionStatus::Cancelled {
            reason: reason.to_string(),
        });
    }

    fn cancel_remaining(&mut self, reason: &str) {
        while let Some(inv) = self.plan.step(self.cursor) {
            self.steps.push(StepResult {
                index: self.cursor,
                tool_name: inv.tool_name.clone(),
                required: inv.required,
                outcome: StepOutcome::Cancelled {
                    reason: reason.to_string(),
                },
                attempts: 0,
                backoff: Vec::new(),
            });
            self.cursor += 1;
        }
    }

    fn finalize(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        let failed_required = self
            .steps
            .iter()
            .find(|s| s.required && !s.outcome.is_success());
        self.outcome = Some(match failed_required {
            None => ExecutionStatus::Completed,
            Some(step) => ExecutionStatus::Failed {
                reason: format!("required step {} ({}) {}", step.index, step.tool_name, step.outcome.label()),
            },
        });
    }

    /// Close the run and produce its result. Unfinished runs are cancelled.
    pub fn into_result(mut self) -> ExecutionResult {
        if !self.is_finished() {
            self.cancel("run closed before completion");
        }
        let status = self
            .outcome
            .take()
            .unwrap_or(ExecutionStatus::Cancelled {
                reason: "run closed before completion".into(),
            });
        let mut goal = self.goal;
        goal.status = status.goal_status();
        let partial_outputs = self
            .steps
            .iter()
            .filter_map(|s| match &s.outcome {
                StepOutcome::Success { output } => Some(output.clone()),
                _ => None,
            })
            .collect();
        ExecutionResult {
            goal,
            track: self.track,
            status,
            steps: self.steps,
            partial_outputs,
            planning_error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Collaborators a step needs.
pub struct ExecutorContext<'a> {
    pub safety: &'a mut SafetyMonitor,
    pub registry: &'a dyn CapabilityRegistry,
    pub planner: &'a dyn Planner,
}

impl<'a> ExecutorContext<'a> {
    pub fn new(
        safety: &'a mut SafetyMonitor,
        registry: &'a dyn CapabilityRegistry,
        planner: &'a dyn Planner,
    ) -> Self {
        Self {
            safety,
            registry,
            planner,
        }
    }

    fn override_entered(&self) -> bool {
        self.safety.shared_mode().load() == Mode::SafetyOverride
    }

    /// True unless the active override came from a soft escalation.
    fn override_is_hard(&self) -> bool {
        self.safety
            .override_cause()
            .map(|c| c.is_hard())
            .unwrap_or(true)
    }
}

type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Runs plans under the retry policy and safety checkpoints.
#[derive(Clone)]
pub struct ActionExecutor {
    policy: RetryPolicy,
    sleep: SleepFn,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the backoff sleep, e.g. with a recorder in tests.
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Plan `goal` and mark it executing. A planning failure yields the
    /// final result directly.
    pub fn begin(
        &self,
        mut goal: Goal,
        track: Track,
        ctx: &mut ExecutorContext<'_>,
    ) -> Result<PlanRun, ExecutionResult> {
        goal.status = GoalStatus::Executing;
        ctx.safety.begin_goal(goal.id);

        let available = ctx.registry.available_tools();
        match ctx.planner.generate_plan(&goal, &available) {
            Ok(plan) => {
                tracing::debug!(goal = %goal.id, steps = plan.len(), track = track.label(), "plan ready");
                Ok(PlanRun {
                    goal,
                    track,
                    plan,
                    cursor: 0,
                    steps: Vec::new(),
                    outcome: None,
                })
            }
            Err(e) => {
                tracing::warn!(goal = %goal.id, error = %e, "planning failed");
                let reason = format!("planning failed: {e}");
                goal.status = GoalStatus::Failed {
                    reason: reason.clone(),
                };
                Err(ExecutionResult {
                    goal,
                    track,
                    status: ExecutionStatus::Failed { reason },
                    steps: Vec::new(),
                    partial_outputs: Vec::new(),
                    planning_error: Some(e.to_string()),
                })
            }
        }
    }

    /// Advance `run` by one step. Returns whether work remains.
    pub fn step(&self, run: &mut PlanRun, ctx: &mut ExecutorContext<'_>) -> bool {
        if run.is_finished() {
            return false;
        }

        // Checkpoint before the step.
        if ctx.override_entered() {
            run.cancel("safety override entered");
            return false;
        }

        let Some(invocation) = run.plan.step(run.cursor).cloned() else {
            run.finalize();
            return false;
        };

        let result = self.dispatch(run, &invocation, ctx);
        let denied = matches!(result.outcome, StepOutcome::Denied { .. });
        let halt = match &result.outcome {
            StepOutcome::Denied { .. } => Some("step denied by safety monitor"),
            StepOutcome::Failure { .. } if invocation.required => Some("required step failed"),
            _ => None,
        };
        run.steps.push(result);
        run.cursor += 1;

        // Fail closed: nothing after a denial or a failed required step runs.
        if let Some(reason) = halt {
            run.cancel_remaining(reason);
            if denied {
                run.outcome = Some(ExecutionStatus::Failed {
                    reason: reason.to_string(),
                });
            }
        }

        if run.cursor >= run.plan.len() {
            run.finalize();
            return false;
        }
        true
    }

    /// Plan and run `goal` to the end.
    pub fn execute(&self, goal: Goal, track: Track, ctx: &mut ExecutorContext<'_>) -> ExecutionResult {
        match self.begin(goal, track, ctx) {
            Err(result) => result,
            Ok(mut run) => {
                while self.step(&mut run, ctx) {}
                run.into_result()
            }
        }
    }

    /// Run one invocation through the safety checkpoint and retry loop.
    fn dispatch(
        &self,
        run: &PlanRun,
        invocation: &ToolInvocation,
        ctx: &mut ExecutorContext<'_>,
    ) -> StepResult {
        let goal_id = run.goal.id;
        let mut attempts = 0u32;
        let mut backoff = Vec::new();

        let outcome = loop {
            if let Verdict::Deny(denial) = ctx.safety.check(goal_id, invocation) {
                break StepOutcome::Denied {
                    reason: format!("{}: {}", denial.constraint, denial.reason),
                    kind: denial.kind,
                };
            }

            attempts += 1;
            ctx.safety.record_usage(goal_id, invocation.cost);
            let started = Instant::now();
            let result = ctx.registry.invoke(&invocation.tool_name, &invocation.arguments);
            ctx.safety.record_elapsed(started.elapsed());

            let err = match result {
                Ok(output) => break StepOutcome::Success {
                    output: output.result,
                },
                Err(e) => e,
            };

            if !err.is_transient() || attempts > self.policy.max_attempts {
                break StepOutcome::Failure {
                    error: err.to_string(),
                    permanent: !err.is_transient(),
                };
            }

            // Checkpoint before the retry. A dispatched responsive step may
            // drain its retries only under a soft escalation.
            if ctx.override_entered()
                && (run.track == Track::Autonomous || ctx.override_is_hard())
            {
                tracing::warn!(goal = %goal_id, tool = %invocation.tool_name, "retries abandoned under safety override");
                break StepOutcome::Failure {
                    error: format!("{err}; retries abandoned under safety override"),
                    permanent: false,
                };
            }

            let delay = self.policy.delay_for(attempts);
            tracing::debug!(
                goal = %goal_id,
                tool = %invocation.tool_name,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying transient failure"
            );
            (self.sleep)(delay);
            backoff.push(delay);
        };

        StepResult {
            index: run.cursor,
            tool_name: invocation.tool_name.clone(),
            required: invocation.required,
            outcome,
            attempts,
            backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::agent::capability::CapabilityTable;
    use crate::agent::goal::GoalId;
    use crate::agent::mode::SharedMode;
    use crate::agent::plan::HintPlanner;
    use crate::agent::safety::{OverrideCause, ResourceDelta, SafetyConfig};
    use crate::agent::tool::{Tool, ToolError, ToolInput, ToolOutput, ToolResult, ToolSignature};

    struct Scripted {
        name: &'static str,
        failures: AtomicU32,
        permanent: bool,
        calls: AtomicU32,
    }

    impl Scripted {
        fn ok(name: &'static str) -> Arc<Self> {
            Self::failing(name, 0, false)
        }

        fn failing(name: &'static str, failures: u32, permanent: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures: AtomicU32::new(failures),
                permanent,
                calls: AtomicU32::new(0),
            })
        }
    }

    impl Tool for Scripted {
        fn signature(&self) -> ToolSignature {
            ToolSignature {
                name: self.name.into(),
                description: String::new(),
                parameters: vec![],
            }
        }

        fn execute(&self, _input: &ToolInput) -> ToolResult<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                if self.permanent {
                    return Err(ToolError::Permanent {
                        tool_name: self.name.into(),
                        message: "broken".into(),
                    });
                }
                return Err(ToolError::Transient {
                    tool_name: self.name.into(),
                    message: "flaky".into(),
                });
            }
            Ok(ToolOutput::ok(format!("{} done", self.name)))
        }
    }

    struct Fixture {
        table: CapabilityTable,
        planner: HintPlanner,
        safety: SafetyMonitor,
        mode: SharedMode,
    }

    impl Fixture {
        fn new(tools: Vec<Arc<Scripted>>) -> Self {
            let table = CapabilityTable::new();
            for t in tools {
                table.register_tool(t).unwrap();
            }
            let mode = SharedMode::default();
            Self {
                table,
                planner: HintPlanner::new(),
                safety: SafetyMonitor::new(&SafetyConfig::default(), mode.clone()),
                mode,
            }
        }

        fn ctx(&mut self) -> ExecutorContext<'_> {
            ExecutorContext::new(&mut self.safety, &self.table, &self.planner)
        }
    }

    fn goal(tools: &[&str]) -> Goal {
        let mut g = Goal::external(
            GoalId::new(1),
            0,
            "test goal",
            tools.iter().map(|s| s.to_string()).collect(),
        );
        g.status = GoalStatus::Selected;
        g
    }

    fn recording_executor(max_attempts: u32) -> (ActionExecutor, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&slept);
        let exec = ActionExecutor::new(RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
        .with_sleep(move |d| sink.lock().unwrap().push(d));
        (exec, slept)
    }

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(
            policy.delays(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::from_secs(1));
    }

    #[test]
    fn all_steps_succeed() {
        let mut fx = Fixture::new(vec![Scripted::ok("a"), Scripted::ok("b")]);
        let (exec, _) = recording_executor(3);
        let result = exec.execute(goal(&["a", "b"]), Track::Responsive, &mut fx.ctx());
        assert!(result.succeeded());
        assert_eq!(result.goal.status, GoalStatus::Completed);
        assert_eq!(result.partial_outputs, vec!["a done", "b done"]);
        assert_eq!(fx.safety.usage().dispatches, 2);
    }

    #[test]
    fn transient_failure_retries_with_backoff() {
        let flaky = Scripted::failing("flaky", 2, false);
        let mut fx = Fixture::new(vec![Arc::clone(&flaky)]);
        let (exec, slept) = recording_executor(3);
        let result = exec.execute(goal(&["flaky"]), Track::Responsive, &mut fx.ctx());
        assert!(result.succeeded());
        assert_eq!(result.steps[0].attempts, 3);
        assert_eq!(
            *slept.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_retries_fail_the_goal() {
        let flaky = Scripted::failing("flaky", 10, false);
        let mut fx = Fixture::new(vec![Arc::clone(&flaky)]);
        let (exec, slept) = recording_executor(3);
        let result = exec.execute(goal(&["flaky"]), Track::Responsive, &mut fx.ctx());
        assert!(!result.succeeded());
        assert!(matches!(result.goal.status, GoalStatus::Failed { .. }));
        assert_eq!(result.steps[0].attempts, 4);
        assert_eq!(slept.lock().unwrap().len(), 3);
        assert_eq!(
            result.steps[0].backoff,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let broken = Scripted::failing("broken", 1, true);
        let mut fx = Fixture::new(vec![Arc::clone(&broken)]);
        let (exec, slept) = recording_executor(3);
        let result = exec.execute(goal(&["broken"]), Track::Responsive, &mut fx.ctx());
        assert!(!result.succeeded());
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert!(slept.lock().unwrap().is_empty());
        assert!(matches!(
            result.steps[0].outcome,
            StepOutcome::Failure { permanent: true, .. }
        ));
    }

    #[test]
    fn planning_failure_fails_without_steps() {
        let mut fx = Fixture::new(vec![]);
        let (exec, _) = recording_executor(3);
        let result = exec.execute(goal(&["missing"]), Track::Responsive, &mut fx.ctx());
        assert!(!result.succeeded());
        assert!(result.planning_error.is_some());
        assert!(result.steps.is_empty());
    }

    #[test]
    fn denial_fails_closed_and_cancels_rest() {
        let mut fx = Fixture::new(vec![Scripted::ok("a"), Scripted::ok("b")]);
        fx.safety.block("a");
        let (exec, _) = recording_executor(3);
        let result = exec.execute(goal(&["a", "b"]), Track::Responsive, &mut fx.ctx());
        assert!(matches!(result.status, ExecutionStatus::Failed { .. }));
        assert!(matches!(result.steps[0].outcome, StepOutcome::Denied { .. }));
        assert!(matches!(result.steps[1].outcome, StepOutcome::Cancelled { .. }));
        assert_eq!(fx.safety.usage().dispatches, 0);
    }

    #[test]
    fn optional_failure_does_not_fail_goal() {
        struct OptionalPlanner;
        impl Planner for OptionalPlanner {
            fn generate_plan(
                &self,
                goal: &Goal,
                _available: &[ToolSignature],
            ) -> crate::agent::plan::PlanningResult<ActionPlan> {
                Ok(ActionPlan::new(
                    goal.id,
                    vec![
                        ToolInvocation::new("broken").optional(),
                        ToolInvocation::new("a"),
                    ],
                ))
            }
        }
        let mut fx = Fixture::new(vec![Scripted::failing("broken", 1, true), Scripted::ok("a")]);
        let (exec, _) = recording_executor(0);
        let mut ctx = ExecutorContext::new(&mut fx.safety, &fx.table, &OptionalPlanner);
        let result = exec.execute(goal(&[]), Track::Responsive, &mut ctx);
        assert!(result.succeeded());
        assert_eq!(result.partial_outputs, vec!["a done"]);
    }

    #[test]
    fn override_cancels_autonomous_run_at_checkpoint() {
        let mut fx = Fixture::new(vec![Scripted::ok("a"), Scripted::ok("b"), Scripted::ok("c")]);
        let (exec, _) = recording_executor(3);
        let mut run = exec
            .begin(goal(&["a", "b", "c"]), Track::Autonomous, &mut fx.ctx())
            .unwrap();
        assert!(exec.step(&mut run, &mut fx.ctx()));

        fx.safety.raise_alert("operator emergency");
        assert_eq!(fx.mode.load(), Mode::SafetyOverride);
        assert!(!exec.step(&mut run, &mut fx.ctx()));

        let result = run.into_result();
        assert!(matches!(result.status, ExecutionStatus::Cancelled { .. }));
        assert!(matches!(result.goal.status, GoalStatus::Abandoned { .. }));
        assert!(result.steps[0].outcome.is_success());
        assert_eq!(result.steps_with("cancelled").count(), 2);
        assert_eq!(result.partial_outputs, vec!["a done"]);
    }

    /// Raises an alert on its first call, then fails transiently.
    struct AlarmTool {
        mode: SharedMode,
        calls: AtomicU32,
    }

    impl Tool for AlarmTool {
        fn signature(&self) -> ToolSignature {
            ToolSignature {
                name: "alarm".into(),
                description: String::new(),
                parameters: vec![],
            }
        }

        fn execute(&self, _input: &ToolInput) -> ToolResult<ToolOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.mode.store(Mode::SafetyOverride);
            Err(ToolError::Transient {
                tool_name: "alarm".into(),
                message: "interrupted".into(),
            })
        }
    }

    #[test]
    fn hard_override_stops_responsive_retries() {
        let mode = SharedMode::default();
        let alarm = Arc::new(AlarmTool {
            mode: mode.clone(),
            calls: AtomicU32::new(0),
        });
        let table = CapabilityTable::new();
        table.register_tool(alarm.clone()).unwrap();
        let mut safety = SafetyMonitor::new(&SafetyConfig::default(), mode.clone());
        safety.degrade("simulated");
        mode.store(Mode::Responsive);
        let planner = HintPlanner::new();
        let (exec, slept) = recording_executor(3);
        let mut ctx = ExecutorContext::new(&mut safety, &table, &planner);

        let result = exec.execute(goal(&["alarm"]), Track::Responsive, &mut ctx);
        // The dispatched step ran exactly once; no retries under a hard cause.
        assert_eq!(alarm.calls.load(Ordering::SeqCst), 1);
        assert!(slept.lock().unwrap().is_empty());
        assert!(!result.succeeded());
    }

    #[test]
    fn soft_override_lets_responsive_retries_drain() {
        let mode = SharedMode::default();
        let alarm = Arc::new(AlarmTool {
            mode: mode.clone(),
            calls: AtomicU32::new(0),
        });
        let table = CapabilityTable::new();
        table.register_tool(alarm.clone()).unwrap();
        let config = SafetyConfig {
            storage_limit_bytes: 10,
            soft_escalation_threshold: 1,
            ..Default::default()
        };
        let mut safety = SafetyMonitor::new(&config, mode.clone());
        safety.check_delta(GoalId::new(99), ResourceDelta::storage(11));
        assert!(matches!(
            safety.override_cause(),
            Some(OverrideCause::SoftEscalation { .. })
        ));
        mode.store(Mode::Responsive);
        let planner = HintPlanner::new();
        let (exec, slept) = recording_executor(2);
        let mut ctx = ExecutorContext::new(&mut safety, &table, &planner);

        let result = exec.execute(goal(&["alarm"]), Track::Responsive, &mut ctx);
        assert_eq!(alarm.calls.load(Ordering::SeqCst), 3);
        assert_eq!(slept.lock().unwrap().len(), 2);
        assert!(!result.succeeded());
    }

    #[test]
    fn autonomous_retries_abandoned_under_any_override() {
        let mode = SharedMode::default();
        let alarm = Arc::new(AlarmTool {
            mode: mode.clone(),
            calls: AtomicU32::new(0),
        });
        let table = CapabilityTable::new();
        table.register_tool(alarm.clone()).unwrap();
        let config = SafetyConfig {
            storage_limit_bytes: 10,
            soft_escalation_threshold: 1,
            ..Default::default()
        };
        let mut safety = SafetyMonitor::new(&config, mode.clone());
        safety.check_delta(GoalId::new(99), ResourceDelta::storage(11));
        mode.store(Mode::Autonomous);
        let planner = HintPlanner::new();
        let (exec, _) = recording_executor(3);
        let mut ctx = ExecutorContext::new(&mut safety, &table, &planner);

        let result = exec.execute(goal(&["alarm"]), Track::Autonomous, &mut ctx);
        assert_eq!(alarm.calls.load(Ordering::SeqCst), 1);
        assert!(!result.succeeded());
    }
}
