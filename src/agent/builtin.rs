//! Built-in demonstration tools and the registry/planner pair the `evo`
//! binary runs against.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::capability::{CapabilityResult, CapabilityTable};
use super::plan::HintPlanner;
use super::safety::ResourceDelta;
use super::tool::{Tool, ToolError, ToolInput, ToolOutput, ToolParam, ToolResult, ToolSignature};

fn goal_param() -> ToolParam {
    ToolParam {
        name: "goal".into(),
        description: "Description of the goal being served.".into(),
        required: true,
    }
}

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

/// Return the goal text unchanged.
pub struct EchoTool;

impl Tool for EchoTool {
    fn signature(&self) -> ToolSignature {
        ToolSignature {
            name: "echo".into(),
            description: "Repeat the goal text.".into(),
            parameters: vec![goal_param()],
        }
    }

    fn execute(&self, input: &ToolInput) -> ToolResult<ToolOutput> {
        let text = input.require("goal", "echo")?;
        Ok(ToolOutput::ok(text))
    }
}

// ---------------------------------------------------------------------------
// summarize
// ---------------------------------------------------------------------------

/// Keep the first `max_words` words of the goal text.
pub struct SummarizeTool {
    pub max_words: usize,
}

impl Default for SummarizeTool {
    fn default() -> Self {
        Self { max_words: 8 }
    }
}

impl Tool for SummarizeTool {
    fn signature(&self) -> ToolSignature {
        ToolSignature {
            name: "summarize".into(),
            description: "Shorten the goal text to its leading words.".into(),
            parameters: vec![goal_param()],
        }
    }

    fn execute(&self, input: &ToolInput) -> ToolResult<ToolOutput> {
        let text = input.require("goal", "summarize")?;
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool_name: "summarize".into(),
                message: "nothing to summarize".into(),
            });
        }
        let mut summary = words
            .iter()
            .take(self.max_words)
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if words.len() > self.max_words {
            summary.push_str(" ...");
        }
        Ok(ToolOutput::ok(summary))
    }
}

// ---------------------------------------------------------------------------
// flaky_fetch
// ---------------------------------------------------------------------------

/// Simulated network fetch that fails transiently on its first
/// `failures_before_success` calls.
pub struct FlakyFetchTool {
    failures_before_success: u32,
    calls: AtomicU32,
}

impl FlakyFetchTool {
    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Tool for FlakyFetchTool {
    fn signature(&self) -> ToolSignature {
        ToolSignature {
            name: "flaky_fetch".into(),
            description: "Fetch a resource over an unreliable link.".into(),
            parameters: vec![goal_param()],
        }
    }

    fn execute(&self, input: &ToolInput) -> ToolResult<ToolOutput> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if call <= self.failures_before_success {
            return Err(ToolError::Transient {
                tool_name: "flaky_fetch".into(),
                message: format!("connection reset (attempt {call})"),
            });
        }
        let what = input.get("goal").unwrap_or("resource");
        Ok(ToolOutput::ok(format!("fetched: {what}")))
    }
}

// ---------------------------------------------------------------------------
// store_note
// ---------------------------------------------------------------------------

/// Append the goal text to a shared note list.
#[derive(Default)]
pub struct StoreNoteTool {
    notes: Arc<Mutex<Vec<String>>>,
}

impl StoreNoteTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the stored notes.
    pub fn notes(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.notes)
    }
}

impl Tool for StoreNoteTool {
    fn signature(&self) -> ToolSignature {
        ToolSignature {
            name: "store_note".into(),
            description: "Persist a note; consumes storage.".into(),
            parameters: vec![goal_param()],
        }
    }

    fn execute(&self, input: &ToolInput) -> ToolResult<ToolOutput> {
        let text = input.require("goal", "store_note")?;
        let mut notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
        notes.push(text.to_string());
        Ok(ToolOutput::ok(format!("note #{} stored", notes.len())))
    }
}

/// Storage charged per `store_note` step.
pub const NOTE_STORAGE_BYTES: u64 = 4096;

/// Registry with every built-in tool, plus the `planning` skill and a
/// knowledge entry naming the agent.
pub fn demo_registry() -> CapabilityResult<CapabilityTable> {
    let table = CapabilityTable::new();
    table.register_tool(Arc::new(EchoTool))?;
    table.register_tool(Arc::new(SummarizeTool::default()))?;
    table.register_tool(Arc::new(FlakyFetchTool::new(1)))?;
    table.register_tool(Arc::new(StoreNoteTool::new()))?;
    table.register_skill("planning", "Break goals into tool steps.", 0.5)?;
    table.register_knowledge(
        "identity",
        "Who the agent is.",
        serde_json::json!({ "name": "evo" }),
    )?;
    Ok(table)
}

/// Planner charging one compute unit per step and storage for notes.
pub fn demo_planner() -> HintPlanner {
    HintPlanner::new()
        .with_step_cost(ResourceDelta::compute(1))
        .with_tool_cost(
            "store_note",
            ResourceDelta {
                compute_units: 1,
                storage_bytes: NOTE_STORAGE_BYTES,
                ..Default::default()
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::capability::CapabilityRegistry;

    fn input(text: &str) -> ToolInput {
        ToolInput::new().with_param("goal", text)
    }

    #[test]
    fn summarize_truncates() {
        let tool = SummarizeTool { max_words: 2 };
        let out = tool.execute(&input("one two three")).unwrap();
        assert_eq!(out.result, "one two ...");
        assert!(tool.execute(&input("   ")).is_err());
    }

    #[test]
    fn flaky_fetch_recovers() {
        let tool = FlakyFetchTool::new(2);
        assert!(tool.execute(&input("x")).unwrap_err().is_transient());
        assert!(tool.execute(&input("x")).unwrap_err().is_transient());
        assert_eq!(tool.execute(&input("x")).unwrap().result, "fetched: x");
        assert_eq!(tool.calls(), 3);
    }

    #[test]
    fn store_note_appends() {
        let tool = StoreNoteTool::new();
        tool.execute(&input("remember")).unwrap();
        let notes = tool.notes();
        assert_eq!(notes.lock().unwrap().as_slice(), ["remember".to_string()]);
    }

    #[test]
    fn echo_requires_goal() {
        let err = EchoTool.execute(&ToolInput::new()).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn demo_registry_lists_tools() {
        let table = demo_registry().unwrap();
        let names: Vec<String> = table.available_tools().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo", "flaky_fetch", "store_note", "summarize"]);
        assert_eq!(table.len(), 6);
    }
}
