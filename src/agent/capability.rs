//! Capability registry: tools, skills, and knowledge the agent can draw on.
//!
//! Entries are tagged variants keyed by name. Tools are invocable; skills
//! carry a proficiency level in [0, 1]; knowledge entries carry arbitrary
//! JSON. Usage counts feed the exploration scheduler's novelty search.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tool::{Tool, ToolError, ToolInput, ToolOutput, ToolResult, ToolSignature, is_valid_tool_name};

/// Errors from registry maintenance.
#[derive(Debug, Error, Diagnostic)]
pub enum CapabilityError {
    #[error("invalid capability name: \"{name}\"")]
    #[diagnostic(
        code(evo::capability::invalid_name),
        help("Capability names must be non-empty; tool names may only contain ASCII letters, digits, and underscores.")
    )]
    InvalidName { name: String },

    #[error("skill level {level} for \"{name}\" is outside [0, 1]")]
    #[diagnostic(
        code(evo::capability::invalid_level),
        help("Skill levels are proficiency fractions between 0.0 and 1.0.")
    )]
    InvalidSkillLevel { name: String, level: f32 },

    #[error("capability not found: \"{name}\"")]
    #[diagnostic(
        code(evo::capability::not_found),
        help("List registered capabilities with `search(\"\")`.")
    )]
    NotFound { name: String },

    #[error("capability \"{name}\" is a {actual}, not a {expected}")]
    #[diagnostic(
        code(evo::capability::wrong_kind),
        help("Each name maps to exactly one kind of capability.")
    )]
    WrongKind {
        name: String,
        expected: CapabilityKind,
        actual: CapabilityKind,
    },
}

/// Result type for capability registry maintenance.
pub type CapabilityResult<T> = std::result::Result<T, CapabilityError>;

/// Tag of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Skill,
    Knowledge,
}

impl CapabilityKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Skill => "skill",
            Self::Knowledge => "knowledge",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Payload of a registry entry.
#[derive(Clone)]
pub enum CapabilityEntry {
    Tool(Arc<dyn Tool>),
    Skill { level: f32 },
    Knowledge { value: serde_json::Value },
}

impl CapabilityEntry {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Tool(_) => CapabilityKind::Tool,
            Self::Skill { .. } => CapabilityKind::Skill,
            Self::Knowledge { .. } => CapabilityKind::Knowledge,
        }
    }
}

impl fmt::Debug for CapabilityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool(tool) => f.debug_tuple("Tool").field(&tool.signature().name).finish(),
            Self::Skill { level } => f.debug_struct("Skill").field("level", level).finish(),
            Self::Knowledge { value } => f.debug_struct("Knowledge").field("value", value).finish(),
        }
    }
}

/// A named registry entry.
#[derive(Debug, Clone)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub entry: CapabilityEntry,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMatch {
    pub name: String,
    pub kind: CapabilityKind,
    pub description: String,
}

/// Contract the executor and exploration scheduler rely on.
pub trait CapabilityRegistry: Send + Sync {
    /// Signatures of every invocable tool, sorted by name.
    fn available_tools(&self) -> Vec<ToolSignature>;

    /// Run a tool. Unknown or non-tool names fail permanently.
    fn invoke(&self, tool_name: &str, args: &ToolInput) -> ToolResult<ToolOutput>;

    /// Case-insensitive substring search over names and descriptions.
    fn search(&self, query: &str) -> Vec<CapabilityMatch>;

    /// Tools that have never been invoked, sorted by name.
    fn report_unused(&self) -> Vec<String>;
}

/// In-process registry keyed by capability name.
#[derive(Default)]
pub struct CapabilityTable {
    entries: DashMap<String, Capability>,
    usage: DashMap<String, u64>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its signature name, replacing any previous entry.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> CapabilityResult<()> {
        let sig = tool.signature();
        if !is_valid_tool_name(&sig.name) {
            return Err(CapabilityError::InvalidName { name: sig.name });
        }
        tracing::debug!(tool = %sig.name, "tool registered");
        self.entries.insert(
            sig.name.clone(),
            Capability {
                name: sig.name,
                description: sig.description,
                entry: CapabilityEntry::Tool(tool),
            },
        );
        Ok(())
    }

    pub fn register_skill(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        level: f32,
    ) -> CapabilityResult<()> {
        let name = name.into();
        validate_name(&name)?;
        if !(0.0..=1.0).contains(&level) {
            return Err(CapabilityError::InvalidSkillLevel { name, level });
        }
        self.entries.insert(
            name.clone(),
            Capability {
                name,
                description: description.into(),
                entry: CapabilityEntry::Skill { level },
            },
        );
        Ok(())
    }

    pub fn register_knowledge(
        &self,
        key: impl Into<String>,
        description: impl Into<String>,
        value: serde_json::Value,
    ) -> CapabilityResult<()> {
        let key = key.into();
        validate_name(&key)?;
        self.entries.insert(
            key.clone(),
            Capability {
                name: key,
                description: description.into(),
                entry: CapabilityEntry::Knowledge { value },
            },
        );
        Ok(())
    }

    /// Change a skill's level.
    pub fn update_skill(&self, name: &str, level: f32) -> CapabilityResult<()> {
        if !(0.0..=1.0).contains(&level) {
            return Err(CapabilityError::InvalidSkillLevel {
                name: name.into(),
                level,
            });
        }
        let mut entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| CapabilityError::NotFound { name: name.into() })?;
        match &mut entry.entry {
            CapabilityEntry::Skill { level: current } => {
                *current = level;
                Ok(())
            }
            other => Err(CapabilityError::WrongKind {
                name: name.into(),
                expected: CapabilityKind::Skill,
                actual: other.kind(),
            }),
        }
    }

    pub fn skill_level(&self, name: &str) -> Option<f32> {
        self.entries.get(name).and_then(|c| match c.entry {
            CapabilityEntry::Skill { level } => Some(level),
            _ => None,
        })
    }

    pub fn knowledge(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).and_then(|c| match &c.entry {
            CapabilityEntry::Knowledge { value } => Some(value.clone()),
            _ => None,
        })
    }

    /// Remove an entry at runtime.
    pub fn unregister(&self, name: &str) -> CapabilityResult<Capability> {
        self.usage.remove(name);
        self.entries
            .remove(name)
            .map(|(_, c)| c)
            .ok_or_else(|| CapabilityError::NotFound { name: name.into() })
    }

    pub fn kind_of(&self, name: &str) -> Option<CapabilityKind> {
        self.entries.get(name).map(|c| c.entry.kind())
    }

    /// Names of every entry of `kind`, sorted.
    pub fn names_of(&self, kind: CapabilityKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|c| c.entry.kind() == kind)
            .map(|c| c.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn usage_count(&self, name: &str) -> u64 {
        self.usage.get(name).map(|n| *n).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CapabilityRegistry for CapabilityTable {
    fn available_tools(&self) -> Vec<ToolSignature> {
        let mut sigs: Vec<ToolSignature> = self
            .entries
            .iter()
            .filter_map(|c| match &c.entry {
                CapabilityEntry::Tool(tool) => Some(tool.signature()),
                _ => None,
            })
            .collect();
        sigs.sort_by(|a, b| a.name.cmp(&b.name));
        sigs
    }

    fn invoke(&self, tool_name: &str, args: &ToolInput) -> ToolResult<ToolOutput> {
        // Clone the handle out so the map shard is not locked during the call.
        let tool = {
            let entry = self.entries.get(tool_name).ok_or_else(|| ToolError::NotFound {
                name: tool_name.into(),
            })?;
            match &entry.entry {
                CapabilityEntry::Tool(tool) => Arc::clone(tool),
                other => {
                    return Err(ToolError::Permanent {
                        tool_name: tool_name.into(),
                        message: format!("\"{tool_name}\" is a {}, not a tool", other.kind()),
                    });
                }
            }
        };
        *self.usage.entry(tool_name.to_string()).or_insert(0) += 1;
        tool.execute(args)
    }

    fn search(&self, query: &str) -> Vec<CapabilityMatch> {
        let needle = query.to_lowercase();
        let mut hits: Vec<CapabilityMatch> = self
            .entries
            .iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&needle)
                    || c.description.to_lowercase().contains(&needle)
            })
            .map(|c| CapabilityMatch {
                name: c.name.clone(),
                kind: c.entry.kind(),
                description: c.description.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.name.cmp(&b.name));
        hits
    }

    fn report_unused(&self) -> Vec<String> {
        self.names_of(CapabilityKind::Tool)
            .into_iter()
            .filter(|name| self.usage_count(name) == 0)
            .collect()
    }
}

impl fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("tools", &self.names_of(CapabilityKind::Tool))
            .field("skills", &self.names_of(CapabilityKind::Skill))
            .field("knowledge", &self.names_of(CapabilityKind::Knowledge))
            .finish()
    }
}

fn validate_name(name: &str) -> CapabilityResult<()> {
    if name.trim().is_empty() {
        return Err(CapabilityError::InvalidName { name: name.into() });
    }
    Ok(())
}
