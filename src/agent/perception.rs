//! Perception gateway: the control loop's only view of the outside world.
//!
//! Events are drained once per tick and handed over in source-priority order,
//! so a safety alert is always handled before the user input that arrived in
//! the same tick.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::goal::now_secs;

/// Where an input came from. Lower priority values are handled first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    Safety,
    User,
    Internet,
    Environment,
    System,
}

impl InputSource {
    pub fn priority(self) -> u8 {
        match self {
            Self::Safety => 0,
            Self::User => 1,
            Self::Internet => 2,
            Self::Environment => 3,
            Self::System => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Safety => "safety",
            Self::User => "user",
            Self::Internet => "internet",
            Self::Environment => "environment",
            Self::System => "system",
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    pub source: InputSource,
    pub priority: u8,
    pub payload: String,
    /// Seconds since the Unix epoch.
    pub received_at: u64,
    /// Capability hints for user goals.
    #[serde(default)]
    pub hints: Vec<String>,
}

impl InputEvent {
    pub fn new(source: InputSource, payload: impl Into<String>) -> Self {
        Self {
            source,
            priority: source.priority(),
            payload: payload.into(),
            received_at: now_secs(),
            hints: Vec::new(),
        }
    }

    pub fn with_hints(mut self, hints: Vec<String>) -> Self {
        self.hints = hints;
        self
    }
}

/// Source of input events for the control loop.
pub trait PerceptionGateway: Send {
    /// Drain pending events, highest priority (lowest value) first. Events of
    /// equal priority keep arrival order.
    fn poll(&mut self) -> Vec<InputEvent>;
}

// ── InputHandle ──────────────────────────────────────────────────────────

/// Cloneable handle for feeding a [`QueueGateway`] from anywhere.
#[derive(Debug, Clone)]
pub struct InputHandle {
    queue: Arc<Mutex<VecDeque<InputEvent>>>,
}

impl InputHandle {
    pub fn push(&self, event: InputEvent) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    pub fn push_user(&self, text: impl Into<String>) {
        self.push(InputEvent::new(InputSource::User, text));
    }

    pub fn push_user_with_hints(&self, text: impl Into<String>, hints: Vec<String>) {
        self.push(InputEvent::new(InputSource::User, text).with_hints(hints));
    }

    /// Raise an external safety alert.
    pub fn push_safety(&self, detail: impl Into<String>) {
        self.push(InputEvent::new(InputSource::Safety, detail));
    }

    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ── QueueGateway ─────────────────────────────────────────────────────────

/// In-process gateway backed by a shared queue.
#[derive(Debug, Default)]
pub struct QueueGateway {
    queue: Arc<Mutex<VecDeque<InputEvent>>>,
}

impl QueueGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> InputHandle {
        InputHandle {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl PerceptionGateway for QueueGateway {
    fn poll(&mut self) -> Vec<InputEvent> {
        let mut events: Vec<InputEvent> = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        events.sort_by_key(|e| e.priority);
        events
    }
}
