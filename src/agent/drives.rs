//! Intrinsic drives: the four motivations that produce internal goals.
//!
//! A drive does not hold state of its own. Its strength lives in the
//! [`SelfModel`] as a strategy weight that reflection tunes over time, and
//! each drive maps the current capability picture to a goal proposal.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::metacognition::SelfModel;

/// The four intrinsic drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveKind {
    /// Reduce uncertainty about capabilities the agent knows little about.
    Curiosity,
    /// Improve the capabilities that perform worst.
    Competence,
    /// Act independently with what the agent already does well.
    Autonomy,
    /// Search for purpose.
    Meaning,
}

impl DriveKind {
    /// All drive kinds in declaration order.
    pub const ALL: [DriveKind; 4] = [
        DriveKind::Curiosity,
        DriveKind::Competence,
        DriveKind::Autonomy,
        DriveKind::Meaning,
    ];

    /// Stable position of this drive in [`DriveKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::Curiosity => 0,
            Self::Competence => 1,
            Self::Autonomy => 2,
            Self::Meaning => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Curiosity => "curiosity",
            Self::Competence => "competence",
            Self::Autonomy => "autonomy",
            Self::Meaning => "meaning",
        }
    }

    /// Parse a drive from its label.
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "curiosity" => Some(Self::Curiosity),
            "competence" => Some(Self::Competence),
            "autonomy" => Some(Self::Autonomy),
            "meaning" => Some(Self::Meaning),
            _ => None,
        }
    }
}

impl fmt::Display for DriveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a drive wants to do next.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveProposal {
    pub drive: DriveKind,
    pub description: String,
    pub capabilities: Vec<String>,
}

/// Produce the goal proposal for `drive` given the tools currently available.
///
/// Unknown capabilities are treated at the self-model's default confidence.
/// Ties between capabilities resolve to the alphabetically first name so
/// proposals are reproducible.
pub fn propose(drive: DriveKind, tools: &[String], model: &SelfModel) -> DriveProposal {
    let mut sorted: Vec<&String> = tools.iter().collect();
    sorted.sort();
    sorted.dedup();

    let pick = |key: &dyn Fn(f32) -> f32| -> Option<String> {
        let mut best: Option<(&String, f32)> = None;
        for &name in &sorted {
            let k = key(model.confidence(name));
            match best {
                Some((_, b)) if k <= b => {}
                _ => best = Some((name, k)),
            }
        }
        best.map(|(name, _)| name.clone())
    };

    let (description, target) = match drive {
        // Closest to 0.5 is the most uncertain.
        DriveKind::Curiosity => {
            let target = pick(&|c: f32| -(c - 0.5).abs());
            ("reduce uncertainty", target)
        }
        DriveKind::Competence => {
            let target = pick(&|c: f32| -c);
            ("improve capability", target)
        }
        DriveKind::Autonomy => {
            let target = pick(&|c: f32| c);
            ("act independently", target)
        }
        DriveKind::Meaning => {
            let target = pick(&|c: f32| c);
            ("find purpose", target)
        }
    };

    match target {
        Some(cap) => DriveProposal {
            drive,
            description: format!("{description} with {cap}"),
            capabilities: vec![cap],
        },
        None => DriveProposal {
            drive,
            description: description.to_string(),
            capabilities: Vec::new(),
        },
    }
}
