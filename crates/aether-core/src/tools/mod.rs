// Tool abstraction and registry
//
// Tools are the only way an agent touches the world. Each tool declares a
// unique name, a JSON-schema parameter description, and whether its executor
// is gated behind client approval. The registry is sealed: registering a
// name twice fails rather than shadowing, so plugin and MCP layers share one
// namespace with the builtins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{KernelError, Result};
use crate::llm::ToolSpec;
use crate::memory::MemoryStore;
use crate::process::ProcessManager;
use crate::sandbox::Sandbox;
use crate::types::Pid;

mod browser;
mod core;
mod fs;
mod ipc;
mod memory;

pub use browser::{BrowseWebTool, ClickElementTool};
pub use core::{CompleteTool, ThinkTool};
pub use fs::{ListFilesTool, MkdirTool, ReadFileTool, RunCommandTool, WriteFileTool};
pub use ipc::{DelegateTaskTool, ListAgentsTool, SendMessageTool};
pub use memory::{ForgetTool, RecallTool, RememberTool};

/// Everything an executor may touch, scoped to the calling process
pub struct ToolContext {
    pub pid: Pid,
    pub owner_uid: String,
    pub role: String,
    pub sandbox: Arc<dyn Sandbox>,
    pub memory: Option<Arc<MemoryStore>>,
    pub processes: Arc<ProcessManager>,
    pub cancel: CancellationToken,
}

/// Result of a tool execution, fed back to the LLM as an observation
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    pub artifacts: Vec<String>,
}

impl ToolOutcome {
    /// Successful execution
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            artifacts: Vec::new(),
        }
    }

    /// Successful execution that produced artifacts
    pub fn ok_with_artifacts(output: impl Into<String>, artifacts: Vec<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            artifacts,
        }
    }

    /// Failed execution; the message is shown to the LLM so it can recover
    pub fn error(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            artifacts: Vec::new(),
        }
    }
}

/// Trait for implementing tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, lowercase with underscores
    fn name(&self) -> &str;

    /// Description shown in the tool catalog
    fn description(&self) -> &str;

    /// JSON schema for the arguments
    fn parameters_schema(&self) -> Value;

    /// Whether execution must wait for a client approval
    fn requires_approval(&self) -> bool {
        false
    }

    /// Run the tool
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome;
}

/// Map a few common model-invented names onto registered tools
pub fn normalize_alias(name: &str) -> &str {
    match name {
        "finish" | "done" | "final_answer" => "complete",
        "bash" | "shell" | "execute_command" => "run_command",
        "ls" | "list_directory" => "list_files",
        "read" | "cat" => "read_file",
        "write" | "create_file" => "write_file",
        "memorize" | "save_memory" => "remember",
        "search_memory" => "recall",
        other => other,
    }
}

/// Sealed name -> tool map
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with all builtin tools registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for tool in builtin_tools() {
            registry
                .register_arc(tool)
                .expect("builtin tool names are unique");
        }
        registry
    }

    /// Register a tool. Fails on an invalid name or when the name is taken.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register an Arc-wrapped tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            return Err(KernelError::invalid(format!(
                "tool name must match [a-z_]+: {name:?}"
            )));
        }
        if self.tools.contains_key(&name) {
            return Err(KernelError::invalid(format!(
                "tool name already registered: {name}"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Remove a tool (plugin unload); returns whether it existed
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Look up a tool by (already normalized) name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Specs advertised to the LLM provider, sorted by name
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// `name: description` catalog lines for the system prompt
    pub fn catalog(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .tools
            .values()
            .map(|tool| format!("{}: {}", tool.name(), tool.description()))
            .collect();
        lines.sort();
        lines
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ThinkTool),
        Arc::new(CompleteTool),
        Arc::new(ListFilesTool),
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(MkdirTool),
        Arc::new(RunCommandTool),
        Arc::new(BrowseWebTool),
        Arc::new(ClickElementTool),
        Arc::new(RememberTool),
        Arc::new(RecallTool),
        Arc::new(ForgetTool),
        Arc::new(ListAgentsTool),
        Arc::new(SendMessageTool),
        Arc::new(DelegateTaskTool),
    ]
}

/// Fetch a required string argument
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, ToolOutcome> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolOutcome::error(format!("missing required argument `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_the_contract() {
        let registry = ToolRegistry::with_builtins();
        for name in [
            "think",
            "complete",
            "list_files",
            "read_file",
            "write_file",
            "mkdir",
            "run_command",
            "browse_web",
            "click_element",
            "remember",
            "recall",
            "forget",
            "list_agents",
            "send_message",
            "delegate_task",
        ] {
            assert!(registry.get(name).is_some(), "missing builtin {name}");
        }
        assert_eq!(registry.len(), 15);
    }

    #[test]
    fn shadowing_fails_registration() {
        let mut registry = ToolRegistry::with_builtins();
        let err = registry.register(ThinkTool).unwrap_err();
        assert!(matches!(err, KernelError::InvalidArgument(_)));
    }

    #[test]
    fn invalid_names_are_rejected() {
        struct BadTool;
        #[async_trait]
        impl Tool for BadTool {
            fn name(&self) -> &str {
                "Bad-Name"
            }
            fn description(&self) -> &str {
                "x"
            }
            fn parameters_schema(&self) -> Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolOutcome {
                ToolOutcome::ok("")
            }
        }
        let mut registry = ToolRegistry::new();
        assert!(registry.register(BadTool).is_err());
    }

    #[test]
    fn aliases_normalize_to_builtins() {
        assert_eq!(normalize_alias("finish"), "complete");
        assert_eq!(normalize_alias("bash"), "run_command");
        assert_eq!(normalize_alias("read_file"), "read_file");
        assert_eq!(normalize_alias("no_such"), "no_such");
    }

    #[test]
    fn approval_flags_match_policy() {
        let registry = ToolRegistry::with_builtins();
        assert!(registry.get("run_command").unwrap().requires_approval());
        assert!(registry.get("delegate_task").unwrap().requires_approval());
        assert!(!registry.get("think").unwrap().requires_approval());
        assert!(!registry.get("write_file").unwrap().requires_approval());
    }

    #[test]
    fn specs_are_sorted_and_complete() {
        let registry = ToolRegistry::with_builtins();
        let specs = registry.specs();
        assert_eq!(specs.len(), registry.len());
        let names: Vec<_> = specs.iter().map(|s| s.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
