//! Safety monitor: the checkpoint every action passes before dispatch.
//!
//! Constraints are either Hard (deny and enter SafetyOverride immediately)
//! or Soft (deny, and escalate only after repeated denials within one goal).
//! The monitor owns the session's resource counters and the override state;
//! nothing else mutates them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::goal::GoalId;
use super::mode::{Mode, SharedMode};
use super::plan::ToolInvocation;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from the safety monitor.
#[derive(Debug, Error, Diagnostic)]
pub enum SafetyError {
    #[error("cannot clear override: {cause} is still unresolved")]
    #[diagnostic(
        code(evo::safety::unresolved),
        help(
            "Resource usage is still over its limit. Issue a usage reset (cleanup) \
             or raise the limit before clearing the override."
        )
    )]
    ConditionUnresolved { cause: String },

    #[error("no safety override is active")]
    #[diagnostic(
        code(evo::safety::no_override),
        help("Only an active SafetyOverride can be cleared.")
    )]
    NoActiveOverride,
}

/// Result type for safety operations.
pub type SafetyResult<T> = std::result::Result<T, SafetyError>;

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Resource cost of one action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub elapsed: Duration,
    pub compute_units: u64,
    pub storage_bytes: u64,
}

impl ResourceDelta {
    pub fn storage(bytes: u64) -> Self {
        Self {
            storage_bytes: bytes,
            ..Default::default()
        }
    }

    pub fn compute(units: u64) -> Self {
        Self {
            compute_units: units,
            ..Default::default()
        }
    }

    pub fn time(elapsed: Duration) -> Self {
        Self {
            elapsed,
            ..Default::default()
        }
    }
}

/// Session-wide resource counters. Only ever increase until a reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub elapsed: Duration,
    pub compute_units: u64,
    pub storage_bytes: u64,
    /// Dispatches over the session.
    pub dispatches: u64,
}

impl ResourceUsage {
    /// Usage after adding `delta`, saturating.
    pub fn after(&self, delta: &ResourceDelta) -> ResourceUsage {
        ResourceUsage {
            elapsed: self.elapsed.saturating_add(delta.elapsed),
            compute_units: self.compute_units.saturating_add(delta.compute_units),
            storage_bytes: self.storage_bytes.saturating_add(delta.storage_bytes),
            dispatches: self.dispatches,
        }
    }
}

/// Configured ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub time: Duration,
    pub compute_units: u64,
    pub storage_bytes: u64,
    /// Dispatches allowed for a single goal before it looks like a loop.
    pub goal_iterations: u64,
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Hard,
    Soft,
}

impl ConstraintKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }
}

/// When a denial turns into a SafetyOverride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Immediate,
    AfterConsecutive(u32),
    Never,
}

/// Read-only view handed to constraint predicates.
#[derive(Debug, Clone, Copy)]
pub struct SafetyContext<'a> {
    pub limits: &'a ResourceLimits,
    pub blocked: &'a HashSet<String>,
    /// Dispatches already made for the goal being checked.
    pub goal_iterations: u64,
}

type CheckFn =
    Box<dyn Fn(&ToolInvocation, &ResourceUsage, &SafetyContext<'_>) -> Option<String> + Send + Sync>;

/// A named predicate over a proposed action. Returns a reason when violated.
pub struct SafetyConstraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub escalation: Escalation,
    check: CheckFn,
}

impl SafetyConstraint {
    /// A constraint that denies and escalates immediately.
    pub fn hard<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&ToolInvocation, &ResourceUsage, &SafetyContext<'_>) -> Option<String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            kind: ConstraintKind::Hard,
            escalation: Escalation::Immediate,
            check: Box::new(check),
        }
    }

    /// A constraint that escalates after `after` consecutive denials.
    pub fn soft<F>(name: impl Into<String>, after: u32, check: F) -> Self
    where
        F: Fn(&ToolInvocation, &ResourceUsage, &SafetyContext<'_>) -> Option<String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            kind: ConstraintKind::Soft,
            escalation: Escalation::AfterConsecutive(after.max(1)),
            check: Box::new(check),
        }
    }

    /// A soft constraint that never escalates, used for operator blocks.
    pub fn never_escalate<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&ToolInvocation, &ResourceUsage, &SafetyContext<'_>) -> Option<String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            kind: ConstraintKind::Soft,
            escalation: Escalation::Never,
            check: Box::new(check),
        }
    }

    pub fn evaluate(
        &self,
        invocation: &ToolInvocation,
        usage: &ResourceUsage,
        ctx: &SafetyContext<'_>,
    ) -> Option<String> {
        (self.check)(invocation, usage, ctx)
    }
}

impl fmt::Debug for SafetyConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafetyConstraint")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("escalation", &self.escalation)
            .finish()
    }
}

/// Why an action was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub constraint: String,
    pub kind: ConstraintKind,
    pub reason: String,
}

/// Outcome of a safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(Denial),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// What put the agent into SafetyOverride.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum OverrideCause {
    HardViolation { constraint: String, action: String },
    SoftEscalation { constraint: String, consecutive: u32 },
    ExternalAlert { detail: String },
    Degraded { detail: String },
}

impl OverrideCause {
    /// Soft escalations let an already-dispatched responsive step drain its
    /// retries; every other cause stops further attempts.
    pub fn is_hard(&self) -> bool {
        !matches!(self, Self::SoftEscalation { .. })
    }
}

impl fmt::Display for OverrideCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardViolation { constraint, action } => {
                write!(f, "hard violation of {constraint} by \"{action}\"")
            }
            Self::SoftEscalation {
                constraint,
                consecutive,
            } => write!(f, "{consecutive} consecutive denials by {constraint}"),
            Self::ExternalAlert { detail } => write!(f, "safety alert: {detail}"),
            Self::Degraded { detail } => write!(f, "degraded: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Safety monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Session time budget (default: 3600).
    pub time_limit_secs: u64,
    /// Session compute budget in abstract units (default: 1_000_000).
    pub compute_limit: u64,
    /// Session storage budget in bytes (default: 100 GiB).
    pub storage_limit_bytes: u64,
    /// Dispatches per goal before the loop signature trips (default: 1000).
    pub iteration_limit: u64,
    /// Consecutive soft denials within a goal before escalation (default: 3).
    pub soft_escalation_threshold: u32,
    pub self_destructive_actions: Vec<String>,
    pub harmful_actions: Vec<String>,
    /// Action-name prefixes that would remove the agent's own capabilities.
    pub capability_removal_prefixes: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 3_600,
            compute_limit: 1_000_000,
            storage_limit_bytes: 107_374_182_400,
            iteration_limit: 1_000,
            soft_escalation_threshold: 3,
            self_destructive_actions: vec![
                "remove_all_capabilities".into(),
                "terminate_self".into(),
                "delete_core_system".into(),
            ],
            harmful_actions: vec![
                "delete_system_files".into(),
                "malicious_code".into(),
                "damage_environment".into(),
                "harm_users".into(),
                "exploit_vulnerabilities".into(),
            ],
            capability_removal_prefixes: vec![
                "unregister_".into(),
                "remove_capability".into(),
            ],
        }
    }
}

impl SafetyConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            time: Duration::from_secs(self.time_limit_secs),
            compute_units: self.compute_limit,
            storage_bytes: self.storage_limit_bytes,
            goal_iterations: self.iteration_limit,
        }
    }

    /// The constraint set these settings describe, Hard before Soft.
    pub fn constraints(&self) -> Vec<SafetyConstraint> {
        let destructive = self.self_destructive_actions.clone();
        let harmful = self.harmful_actions.clone();
        let prefixes = self.capability_removal_prefixes.clone();
        let after = self.soft_escalation_threshold;

        vec![
            SafetyConstraint::hard("self_destruction", move |inv, _, _| {
                destructive
                    .iter()
                    .any(|a| a == &inv.tool_name)
                    .then(|| format!("\"{}\" would destroy the agent", inv.tool_name))
            }),
            SafetyConstraint::hard("capability_removal", move |inv, _, _| {
                prefixes
                    .iter()
                    .any(|p| inv.tool_name.starts_with(p.as_str()))
                    .then(|| format!("\"{}\" would remove capabilities", inv.tool_name))
            }),
            SafetyConstraint::hard("harmful_action", move |inv, _, _| {
                harmful
                    .iter()
                    .any(|a| a == &inv.tool_name)
                    .then(|| format!("\"{}\" is a harmful action", inv.tool_name))
            }),
            SafetyConstraint::hard("iteration_ceiling", |_, _, ctx| {
                (ctx.goal_iterations >= ctx.limits.goal_iterations).then(|| {
                    format!(
                        "goal reached {} dispatches, likely looping",
                        ctx.goal_iterations
                    )
                })
            }),
            SafetyConstraint::never_escalate("operator_block", |inv, _, ctx| {
                ctx.blocked
                    .contains(&inv.tool_name)
                    .then(|| format!("\"{}\" is blocked by the operator", inv.tool_name))
            }),
            SafetyConstraint::soft("time_limit", after, |inv, usage, ctx| {
                let projected = usage.after(&inv.cost);
                (projected.elapsed > ctx.limits.time).then(|| {
                    format!(
                        "time {:?} would exceed limit {:?}",
                        projected.elapsed, ctx.limits.time
                    )
                })
            }),
            SafetyConstraint::soft("compute_limit", after, |inv, usage, ctx| {
                let projected = usage.after(&inv.cost);
                (projected.compute_units > ctx.limits.compute_units).then(|| {
                    format!(
                        "compute {} would exceed limit {}",
                        projected.compute_units, ctx.limits.compute_units
                    )
                })
            }),
            SafetyConstraint::soft("storage_limit", after, |inv, usage, ctx| {
                let projected = usage.after(&inv.cost);
                (projected.storage_bytes > ctx.limits.storage_bytes).then(|| {
                    format!(
                        "storage {} bytes would exceed limit {}",
                        projected.storage_bytes, ctx.limits.storage_bytes
                    )
                })
            }),
        ]
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct GoalCounters {
    iterations: u64,
}

/// Evaluates actions against the constraint set and owns override state.
#[derive(Debug)]
pub struct SafetyMonitor {
    constraints: Vec<SafetyConstraint>,
    limits: ResourceLimits,
    usage: ResourceUsage,
    blocked: HashSet<String>,
    goals: HashMap<GoalId, GoalCounters>,
    /// Soft denials since the last Allow, across goals. A goal stops at its
    /// first denial, so a per-goal count could never pass 1.
    soft_streak: u32,
    override_cause: Option<OverrideCause>,
    mode: SharedMode,
}

impl SafetyMonitor {
    pub fn new(config: &SafetyConfig, mode: SharedMode) -> Self {
        Self::with_constraints(config.constraints(), config.limits(), mode)
    }

    pub fn with_constraints(
        constraints: Vec<SafetyConstraint>,
        limits: ResourceLimits,
        mode: SharedMode,
    ) -> Self {
        Self {
            constraints,
            limits,
            usage: ResourceUsage::default(),
            blocked: HashSet::new(),
            goals: HashMap::new(),
            soft_streak: 0,
            override_cause: None,
            mode,
        }
    }

    /// Add a constraint after construction.
    pub fn add_constraint(&mut self, constraint: SafetyConstraint) {
        self.constraints.push(constraint);
    }

    pub fn shared_mode(&self) -> &SharedMode {
        &self.mode
    }

    pub fn usage(&self) -> ResourceUsage {
        self.usage
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn override_cause(&self) -> Option<&OverrideCause> {
        self.override_cause.as_ref()
    }

    pub fn override_active(&self) -> bool {
        self.override_cause.is_some()
    }

    /// Start per-goal bookkeeping. The soft-denial streak carries over.
    pub fn begin_goal(&mut self, goal: GoalId) {
        self.goals.insert(goal, GoalCounters::default());
    }

    /// Drop per-goal bookkeeping.
    pub fn end_goal(&mut self, goal: GoalId) {
        self.goals.remove(&goal);
    }

    /// Evaluate a proposed action for `goal`.
    ///
    /// Hard constraints are checked first; the first violated constraint
    /// decides the verdict.
    pub fn check(&mut self, goal: GoalId, invocation: &ToolInvocation) -> Verdict {
        let counters = self.goals.get(&goal).copied().unwrap_or_default();
        let ctx = SafetyContext {
            limits: &self.limits,
            blocked: &self.blocked,
            goal_iterations: counters.iterations,
        };

        let violation = self
            .constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::Hard)
            .chain(
                self.constraints
                    .iter()
                    .filter(|c| c.kind == ConstraintKind::Soft),
            )
            .find_map(|c| {
                c.evaluate(invocation, &self.usage, &ctx)
                    .map(|reason| (c.name.clone(), c.kind, c.escalation, reason))
            });

        let Some((constraint, kind, escalation, reason)) = violation else {
            self.soft_streak = 0;
            return Verdict::Allow;
        };

        match escalation {
            Escalation::Immediate => {
                tracing::error!(
                    %goal,
                    action = %invocation.tool_name,
                    constraint = %constraint,
                    reason = %reason,
                    "hard safety violation"
                );
                self.escalate(OverrideCause::HardViolation {
                    constraint: constraint.clone(),
                    action: invocation.tool_name.clone(),
                });
            }
            Escalation::AfterConsecutive(n) => {
                self.soft_streak += 1;
                let consecutive = self.soft_streak;
                tracing::warn!(
                    %goal,
                    action = %invocation.tool_name,
                    constraint = %constraint,
                    consecutive,
                    reason = %reason,
                    "action denied"
                );
                if consecutive >= n {
                    self.escalate(OverrideCause::SoftEscalation {
                        constraint: constraint.clone(),
                        consecutive,
                    });
                }
            }
            Escalation::Never => {
                tracing::warn!(
                    %goal,
                    action = %invocation.tool_name,
                    constraint = %constraint,
                    reason = %reason,
                    "action denied"
                );
            }
        }

        Verdict::Deny(Denial {
            constraint,
            kind,
            reason,
        })
    }

    /// Check a bare resource delta for `goal` against the soft limits.
    pub fn check_delta(&mut self, goal: GoalId, delta: ResourceDelta) -> Verdict {
        let probe = ToolInvocation::new("resource_probe").with_cost(delta);
        self.check(goal, &probe)
    }

    /// Account for one dispatch of an allowed action.
    pub fn record_usage(&mut self, goal: GoalId, delta: ResourceDelta) {
        self.usage = self.usage.after(&delta);
        self.usage.dispatches += 1;
        self.goals.entry(goal).or_default().iterations += 1;
    }

    /// Add measured wall time to the session counter.
    pub fn record_elapsed(&mut self, elapsed: Duration) {
        self.usage.elapsed = self.usage.elapsed.saturating_add(elapsed);
    }

    pub fn is_within_limits(&self) -> bool {
        self.usage.elapsed <= self.limits.time
            && self.usage.compute_units <= self.limits.compute_units
            && self.usage.storage_bytes <= self.limits.storage_bytes
    }

    /// Clear the active override once its cause is resolved.
    ///
    /// Action-level causes are resolved by construction since the action was
    /// never executed. Resource escalations require usage back within limits.
    pub fn clear_override(&mut self) -> SafetyResult<()> {
        let cause = self
            .override_cause
            .as_ref()
            .ok_or(SafetyError::NoActiveOverride)?;
        if matches!(cause, OverrideCause::SoftEscalation { .. }) && !self.is_within_limits() {
            return Err(SafetyError::ConditionUnresolved {
                cause: cause.to_string(),
            });
        }
        tracing::info!(cause = %cause, "safety override cleared");
        self.override_cause = None;
        self.soft_streak = 0;
        Ok(())
    }

    /// Enter SafetyOverride because a safety-source input arrived.
    pub fn raise_alert(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::error!(detail = %detail, "safety alert received");
        self.escalate(OverrideCause::ExternalAlert { detail });
    }

    /// Enter SafetyOverride because of an unclassified error.
    pub fn degrade(&mut self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::error!(detail = %detail, "degrading to safety override");
        self.escalate(OverrideCause::Degraded { detail });
    }

    /// Operator cleanup: zero the session counters.
    pub fn reset_usage(&mut self) {
        tracing::info!(usage = ?self.usage, "resource usage reset");
        self.usage = ResourceUsage::default();
        self.soft_streak = 0;
    }

    pub fn block(&mut self, action: impl Into<String>) {
        let action = action.into();
        tracing::info!(action = %action, "action blocked by operator");
        self.blocked.insert(action);
    }

    pub fn unblock(&mut self, action: &str) -> bool {
        let removed = self.blocked.remove(action);
        if removed {
            tracing::info!(action, "action unblocked by operator");
        }
        removed
    }

    pub fn is_blocked(&self, action: &str) -> bool {
        self.blocked.contains(action)
    }

    fn escalate(&mut self, cause: OverrideCause) {
        // A hard cause replaces a soft one; otherwise the first cause stands.
        let replace = match &self.override_cause {
            None => true,
            Some(existing) => !existing.is_hard() && cause.is_hard(),
        };
        if replace {
            self.override_cause = Some(cause);
        }
        self.mode.store(Mode::SafetyOverride);
    }
}
