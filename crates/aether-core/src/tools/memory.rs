// Memory tools: remember, recall, forget

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{required_str, Tool, ToolContext, ToolOutcome};
use crate::memory::{MemoryLayer, NewMemory};

/// Store a memory record
pub struct RememberTool;

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store a memory (layer: episodic, semantic, procedural, or social)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "What to remember"},
                "layer": {
                    "type": "string",
                    "enum": ["episodic", "semantic", "procedural", "social"],
                    "description": "Memory layer"
                },
                "tags": {"type": "array", "items": {"type": "string"}},
                "importance": {"type": "number", "minimum": 0.0, "maximum": 1.0}
            },
            "required": ["content", "layer"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(memory) = &ctx.memory else {
            return ToolOutcome::error("memory store is not available");
        };
        let content = match required_str(&args, "content") {
            Ok(content) => content,
            Err(outcome) => return outcome,
        };
        let layer = match args
            .get("layer")
            .and_then(Value::as_str)
            .and_then(MemoryLayer::parse)
        {
            Some(layer) => layer,
            None => return ToolOutcome::error("layer must be one of episodic, semantic, procedural, social"),
        };
        let tags = args
            .get("tags")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let importance = args
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);

        match memory
            .store(NewMemory {
                agent_uid: ctx.owner_uid.clone(),
                layer,
                content: content.to_string(),
                tags,
                importance,
                expires_at: None,
                source_pid: Some(ctx.pid),
                related_ids: vec![],
            })
            .await
        {
            Ok(id) => ToolOutcome::ok(format!("remembered as {id}")),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

/// Query memories by text
pub struct RecallTool;

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Recall stored memories matching a query"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to search for"},
                "layer": {
                    "type": "string",
                    "enum": ["episodic", "semantic", "procedural", "social"],
                    "description": "Restrict to one layer"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(memory) = &ctx.memory else {
            return ToolOutcome::error("memory store is not available");
        };
        let query = match required_str(&args, "query") {
            Ok(query) => query,
            Err(outcome) => return outcome,
        };
        let layer = args
            .get("layer")
            .and_then(Value::as_str)
            .and_then(MemoryLayer::parse);

        match memory.recall(&ctx.owner_uid, query, 10, layer).await {
            Ok(records) if records.is_empty() => ToolOutcome::ok("no matching memories"),
            Ok(records) => {
                let listing = records
                    .iter()
                    .map(|r| format!("[{}] ({:?}) {}", r.id, r.layer, r.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolOutcome::ok(listing)
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

/// Delete a memory record by id
pub struct ForgetTool;

#[async_trait]
impl Tool for ForgetTool {
    fn name(&self) -> &str {
        "forget"
    }

    fn description(&self) -> &str {
        "Delete a memory record by its id"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Id of the memory to delete"}
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(memory) = &ctx.memory else {
            return ToolOutcome::error("memory store is not available");
        };
        let id = match required_str(&args, "id") {
            Ok(id) => id,
            Err(outcome) => return outcome,
        };
        let Ok(id) = Uuid::parse_str(id) else {
            return ToolOutcome::error("id is not a valid UUID");
        };
        // Agents may only forget their own memories
        match memory.get(id).await {
            Some(record) if record.agent_uid == ctx.owner_uid => match memory.forget(id).await {
                Ok(true) => ToolOutcome::ok(format!("forgot {id}")),
                Ok(false) => ToolOutcome::error("no such memory"),
                Err(e) => ToolOutcome::error(e.to_string()),
            },
            Some(_) => ToolOutcome::error("memory belongs to another agent"),
            None => ToolOutcome::error("no such memory"),
        }
    }
}
