//! Operating mode arbitration.
//!
//! Exactly one [`Mode`] is in force at any instant. The arbiter decides it
//! once per tick and publishes it through a [`SharedMode`] cell that the
//! executor re-reads at every checkpoint.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The agent's operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Mode {
    /// Serve user goals only.
    Responsive = 0,
    /// No user input for a while: pursue internal goals.
    Autonomous = 1,
    /// User input arrived while internal work is in flight: run both tracks.
    Hybrid = 2,
    /// A hard violation is active: nothing new is selected.
    SafetyOverride = 3,
}

impl Mode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Responsive => "responsive",
            Self::Autonomous => "autonomous",
            Self::Hybrid => "hybrid",
            Self::SafetyOverride => "safety_override",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Responsive,
            1 => Self::Autonomous,
            2 => Self::Hybrid,
            _ => Self::SafetyOverride,
        }
    }

    /// Whether user goals may run in this mode.
    pub fn runs_responsive_track(self) -> bool {
        matches!(self, Self::Responsive | Self::Hybrid)
    }

    /// Whether internal goals may run in this mode.
    pub fn runs_autonomous_track(self) -> bool {
        matches!(self, Self::Autonomous | Self::Hybrid)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One of the two cooperatively scheduled execution tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// The user goal; runs to completion within the tick.
    Responsive,
    /// The internal goal; preemptible between steps, spans ticks.
    Autonomous,
}

impl Track {
    pub fn label(self) -> &'static str {
        match self {
            Self::Responsive => "responsive",
            Self::Autonomous => "autonomous",
        }
    }
}

/// Process-wide mode cell. Cloning yields another handle to the same cell.
#[derive(Debug, Clone)]
pub struct SharedMode(Arc<AtomicU8>);

impl SharedMode {
    pub fn new(mode: Mode) -> Self {
        Self(Arc::new(AtomicU8::new(mode as u8)))
    }

    pub fn load(&self) -> Mode {
        Mode::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, mode: Mode) {
        self.0.store(mode as u8, Ordering::Release);
    }
}

impl Default for SharedMode {
    fn default() -> Self {
        Self::new(Mode::Responsive)
    }
}

/// Arbiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Idle time without user input before going autonomous.
    pub idle_threshold_ms: u64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 5_000,
        }
    }
}

impl ArbiterConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }
}

/// Everything the arbiter looks at on a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterInput {
    pub pending_user_input: bool,
    pub idle_duration: Duration,
    pub active_hard_violation: bool,
    pub autonomous_in_flight: bool,
}

/// Picks the mode for each tick.
#[derive(Debug, Clone)]
pub struct ModeArbiter {
    idle_threshold: Duration,
    previous: Mode,
    force_responsive: bool,
}

impl ModeArbiter {
    pub fn new(config: &ArbiterConfig) -> Self {
        Self {
            idle_threshold: config.idle_threshold(),
            previous: Mode::Responsive,
            force_responsive: false,
        }
    }

    /// The mode chosen on the last call, or `Responsive` before the first.
    pub fn current(&self) -> Mode {
        self.previous
    }

    /// Make the next non-override decision `Responsive`.
    pub fn force_responsive(&mut self) {
        self.force_responsive = true;
    }

    /// Decide this tick's mode.
    ///
    /// Priority: active violation, then a pending force, then user input,
    /// then idleness. Otherwise the previous mode is kept, except that a
    /// cleared override falls back to `Responsive`.
    pub fn select_mode(&mut self, input: &ArbiterInput) -> Mode {
        let next = if input.active_hard_violation {
            Mode::SafetyOverride
        } else if self.force_responsive {
            self.force_responsive = false;
            Mode::Responsive
        } else if input.pending_user_input {
            if input.autonomous_in_flight {
                Mode::Hybrid
            } else {
                Mode::Responsive
            }
        } else if input.idle_duration >= self.idle_threshold {
            Mode::Autonomous
        } else if self.previous == Mode::SafetyOverride {
            Mode::Responsive
        } else {
            self.previous
        };

        if next != self.previous {
            tracing::info!(from = %self.previous, to = %next, "mode change");
        }
        self.previous = next;
        next
    }
}
