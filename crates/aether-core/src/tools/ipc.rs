// Inter-agent tools: discovery, messaging, delegation

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{required_str, Tool, ToolContext, ToolOutcome};
use crate::types::{ProcessFilter, SpawnConfig};

/// List other live agents visible to this process
pub struct ListAgentsTool;

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        "list_agents"
    }

    fn description(&self) -> &str {
        "List other running agents (pid, role, goal) available for messaging"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "role": {"type": "string", "description": "Optional role filter"}
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let filter = ProcessFilter {
            role: args
                .get("role")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..Default::default()
        };
        let agents: Vec<_> = ctx
            .processes
            .list(&filter)
            .await
            .into_iter()
            .filter(|info| info.pid != ctx.pid && !info.state.is_terminal())
            .collect();
        if agents.is_empty() {
            return ToolOutcome::ok("no other agents are running");
        }
        let listing = agents
            .iter()
            .map(|info| format!("pid {} [{}] {}", info.pid, info.role, info.goal))
            .collect::<Vec<_>>()
            .join("\n");
        ToolOutcome::ok(listing)
    }
}

/// Send a message to another agent's mailbox
pub struct SendMessageTool;

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to another agent by pid over a named channel"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to_pid": {"type": "integer", "description": "Recipient agent pid"},
                "channel": {"type": "string", "description": "Channel name, e.g. chat"},
                "payload": {"description": "Message payload (any JSON value)"}
            },
            "required": ["to_pid", "channel", "payload"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(to_pid) = args.get("to_pid").and_then(Value::as_i64) else {
            return ToolOutcome::error("missing required argument `to_pid`");
        };
        let channel = match required_str(&args, "channel") {
            Ok(channel) => channel,
            Err(outcome) => return outcome,
        };
        let payload = args.get("payload").cloned().unwrap_or(Value::Null);

        match ctx
            .processes
            .send_ipc(ctx.pid, to_pid, channel, payload)
            .await
        {
            Ok(()) => ToolOutcome::ok(format!("delivered to pid {to_pid} on {channel}")),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

/// Spawn a sub-agent with its own goal. Approval-gated.
pub struct DelegateTaskTool;

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent with a role and goal (requires operator approval)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "role": {"type": "string", "description": "Role of the sub-agent"},
                "goal": {"type": "string", "description": "Goal for the sub-agent"}
            },
            "required": ["role", "goal"]
        })
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let role = match required_str(&args, "role") {
            Ok(role) => role,
            Err(outcome) => return outcome,
        };
        let goal = match required_str(&args, "goal") {
            Ok(goal) => goal,
            Err(outcome) => return outcome,
        };

        let config = SpawnConfig {
            owner_uid: ctx.owner_uid.clone(),
            role: role.to_string(),
            goal: goal.to_string(),
            max_steps: 32,
            model: None,
            plan: None,
            parent_pid: Some(ctx.pid),
        };
        match ctx.processes.spawn(config).await {
            Ok(pid) => ToolOutcome::ok(format!("delegated to new agent pid {pid}")),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}
