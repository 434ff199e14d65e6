// Filesystem and shell tools, sandboxed to the owning process

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{required_str, Tool, ToolContext, ToolOutcome};

const FILE_IO_TIMEOUT: Duration = Duration::from_secs(10);
const SHELL_TIMEOUT: Duration = Duration::from_secs(120);

async fn with_io_timeout<F, T>(future: F) -> Result<T, ToolOutcome>
where
    F: std::future::Future<Output = crate::error::Result<T>>,
{
    match tokio::time::timeout(FILE_IO_TIMEOUT, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ToolOutcome::error(e.to_string())),
        Err(_) => Err(ToolOutcome::error("file operation timed out")),
    }
}

/// List a directory inside the sandbox
pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files and directories at a path inside the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list, relative to the sandbox root"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        match with_io_timeout(ctx.sandbox.list_dir(path)).await {
            Ok(entries) => {
                if entries.is_empty() {
                    return ToolOutcome::ok(format!("{path} is empty"));
                }
                let listing = entries
                    .iter()
                    .map(|e| {
                        if e.is_dir {
                            format!("{}/", e.name)
                        } else {
                            format!("{} ({} bytes)", e.name, e.size)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolOutcome::ok(listing)
            }
            Err(outcome) => outcome,
        }
    }
}

/// Read a file inside the sandbox
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the sandbox root"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let path = match required_str(&args, "path") {
            Ok(path) => path,
            Err(outcome) => return outcome,
        };
        match with_io_timeout(ctx.sandbox.read_file(path)).await {
            Ok(content) => ToolOutcome::ok(content),
            Err(outcome) => outcome,
        }
    }
}

/// Create or overwrite a file inside the sandbox
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a text file in the sandbox, creating parent directories as needed"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the sandbox root"},
                "content": {"type": "string", "description": "File contents"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let path = match required_str(&args, "path") {
            Ok(path) => path,
            Err(outcome) => return outcome,
        };
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        match with_io_timeout(ctx.sandbox.write_file(path, content)).await {
            Ok(()) => ToolOutcome::ok_with_artifacts(
                format!("wrote {} bytes to {path}", content.len()),
                vec![path.to_string()],
            ),
            Err(outcome) => outcome,
        }
    }
}

/// Create a directory inside the sandbox
pub struct MkdirTool;

#[async_trait]
impl Tool for MkdirTool {
    fn name(&self) -> &str {
        "mkdir"
    }

    fn description(&self) -> &str {
        "Create a directory (and parents) in the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory path relative to the sandbox root"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let path = match required_str(&args, "path") {
            Ok(path) => path,
            Err(outcome) => return outcome,
        };
        match with_io_timeout(ctx.sandbox.make_dir(path)).await {
            Ok(()) => ToolOutcome::ok(format!("created {path}")),
            Err(outcome) => outcome,
        }
    }
}

/// Run a shell command inside the sandbox. Always approval-gated.
pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command inside the sandbox (requires operator approval)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"}
            },
            "required": ["command"]
        })
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let command = match required_str(&args, "command") {
            Ok(command) => command,
            Err(outcome) => return outcome,
        };
        match ctx.sandbox.exec(command, SHELL_TIMEOUT, &ctx.cancel).await {
            Ok(result) => {
                let mut output = result.stdout;
                if !result.stderr.is_empty() {
                    output.push_str("\n[stderr]\n");
                    output.push_str(&result.stderr);
                }
                if result.exit_code == 0 {
                    ToolOutcome::ok(output)
                } else {
                    ToolOutcome::error(format!("exit code {}\n{output}", result.exit_code))
                }
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}
