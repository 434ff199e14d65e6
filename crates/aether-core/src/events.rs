// Kernel events for streaming
//
// KernelEvent is the one tagged sum type fanned out on the EventBus and over
// the client protocol. The serde tag doubles as the topic string, so a
// serialized event is exactly the wire frame clients receive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Pid, ProcessPhase, ProcessState, RunOutcome};

/// Events emitted by the kernel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KernelEvent {
    /// A process entered the table
    #[serde(rename = "process.spawned")]
    ProcessSpawned {
        pid: Pid,
        owner_uid: String,
        role: String,
        goal: String,
        timestamp: DateTime<Utc>,
    },

    /// State or phase changed
    #[serde(rename = "process.stateChange")]
    ProcessStateChange {
        pid: Pid,
        owner_uid: String,
        state: ProcessState,
        phase: ProcessPhase,
        timestamp: DateTime<Utc>,
    },

    /// A process reached a terminal state
    #[serde(rename = "process.exit")]
    ProcessExit {
        pid: Pid,
        owner_uid: String,
        code: i32,
        outcome: RunOutcome,
        timestamp: DateTime<Utc>,
    },

    /// An approval-gated tool is pending a client decision
    #[serde(rename = "process.approval_required")]
    ApprovalRequired {
        pid: Pid,
        owner_uid: String,
        tool: String,
        args: Value,
        timestamp: DateTime<Utc>,
    },

    /// The agent produced reasoning for this step
    #[serde(rename = "agent.thought")]
    AgentThought {
        pid: Pid,
        owner_uid: String,
        step: usize,
        thought: String,
        timestamp: DateTime<Utc>,
    },

    /// The agent is invoking a tool
    #[serde(rename = "agent.action")]
    AgentAction {
        pid: Pid,
        owner_uid: String,
        step: usize,
        tool: String,
        args: Value,
        timestamp: DateTime<Utc>,
    },

    /// Result of the tool invocation
    #[serde(rename = "agent.observation")]
    AgentObservation {
        pid: Pid,
        owner_uid: String,
        step: usize,
        success: bool,
        output: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    /// A step finished; the loop continues
    #[serde(rename = "agent.progress")]
    AgentProgress {
        pid: Pid,
        owner_uid: String,
        step: usize,
        max_steps: usize,
        timestamp: DateTime<Utc>,
    },

    /// The run ended
    #[serde(rename = "agent.completed")]
    AgentCompleted {
        pid: Pid,
        owner_uid: String,
        outcome: RunOutcome,
        steps: usize,
        duration_ms: i64,
        summary: String,
        timestamp: DateTime<Utc>,
    },

    /// The step budget ran out; the loop is parked awaiting continuation
    #[serde(rename = "agent.stepLimitReached")]
    StepLimitReached {
        pid: Pid,
        owner_uid: String,
        steps: usize,
        timestamp: DateTime<Utc>,
    },

    /// Middle history was folded into a summary turn
    #[serde(rename = "agent.contextCompacted")]
    ContextCompacted {
        pid: Pid,
        owner_uid: String,
        dropped_entries: usize,
        estimated_tokens: usize,
        timestamp: DateTime<Utc>,
    },

    /// The injection guard refused a tool invocation
    #[serde(rename = "agent.injectionBlocked")]
    InjectionBlocked {
        pid: Pid,
        owner_uid: String,
        tool: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A mailbox message was queued for an agent
    #[serde(rename = "agent.messageReceived")]
    MessageReceived {
        pid: Pid,
        owner_uid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from_pid: Option<Pid>,
        channel: String,
        timestamp: DateTime<Utc>,
    },

    /// A memory record was stored
    #[serde(rename = "memory.stored")]
    MemoryStored {
        id: uuid::Uuid,
        agent_uid: String,
        layer: crate::memory::MemoryLayer,
        timestamp: DateTime<Utc>,
    },

    /// A memory record was removed
    #[serde(rename = "memory.forgotten")]
    MemoryForgotten {
        id: uuid::Uuid,
        agent_uid: String,
        timestamp: DateTime<Utc>,
    },

    /// Session connectivity notice
    #[serde(rename = "connection")]
    Connection {
        uid: String,
        session_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// The kernel finished booting and accepts requests
    #[serde(rename = "kernel.ready")]
    KernelReady {
        version: String,
        timestamp: DateTime<Utc>,
    },

    /// Periodic kernel statistics
    #[serde(rename = "kernel.metrics")]
    KernelMetrics {
        processes_running: usize,
        processes_total: usize,
        bus_dropped_events: u64,
        memory_records: usize,
        timestamp: DateTime<Utc>,
    },

    /// This subscription dropped events since the last delivery
    #[serde(rename = "subscriber.lagged")]
    SubscriberLagged {
        dropped: u64,
        timestamp: DateTime<Utc>,
    },
}

impl KernelEvent {
    /// The dotted topic this event is published under
    pub fn topic(&self) -> &'static str {
        match self {
            KernelEvent::ProcessSpawned { .. } => "process.spawned",
            KernelEvent::ProcessStateChange { .. } => "process.stateChange",
            KernelEvent::ProcessExit { .. } => "process.exit",
            KernelEvent::ApprovalRequired { .. } => "process.approval_required",
            KernelEvent::AgentThought { .. } => "agent.thought",
            KernelEvent::AgentAction { .. } => "agent.action",
            KernelEvent::AgentObservation { .. } => "agent.observation",
            KernelEvent::AgentProgress { .. } => "agent.progress",
            KernelEvent::AgentCompleted { .. } => "agent.completed",
            KernelEvent::StepLimitReached { .. } => "agent.stepLimitReached",
            KernelEvent::ContextCompacted { .. } => "agent.contextCompacted",
            KernelEvent::InjectionBlocked { .. } => "agent.injectionBlocked",
            KernelEvent::MessageReceived { .. } => "agent.messageReceived",
            KernelEvent::MemoryStored { .. } => "memory.stored",
            KernelEvent::MemoryForgotten { .. } => "memory.forgotten",
            KernelEvent::Connection { .. } => "connection",
            KernelEvent::KernelReady { .. } => "kernel.ready",
            KernelEvent::KernelMetrics { .. } => "kernel.metrics",
            KernelEvent::SubscriberLagged { .. } => "subscriber.lagged",
        }
    }

    /// PID this event concerns, if any
    pub fn pid(&self) -> Option<Pid> {
        match self {
            KernelEvent::ProcessSpawned { pid, .. }
            | KernelEvent::ProcessStateChange { pid, .. }
            | KernelEvent::ProcessExit { pid, .. }
            | KernelEvent::ApprovalRequired { pid, .. }
            | KernelEvent::AgentThought { pid, .. }
            | KernelEvent::AgentAction { pid, .. }
            | KernelEvent::AgentObservation { pid, .. }
            | KernelEvent::AgentProgress { pid, .. }
            | KernelEvent::AgentCompleted { pid, .. }
            | KernelEvent::StepLimitReached { pid, .. }
            | KernelEvent::ContextCompacted { pid, .. }
            | KernelEvent::InjectionBlocked { pid, .. }
            | KernelEvent::MessageReceived { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    /// Owner UID used for authorization filtering at the gateway.
    /// Events without an owner are visible to every session.
    pub fn owner_uid(&self) -> Option<&str> {
        match self {
            KernelEvent::ProcessSpawned { owner_uid, .. }
            | KernelEvent::ProcessStateChange { owner_uid, .. }
            | KernelEvent::ProcessExit { owner_uid, .. }
            | KernelEvent::ApprovalRequired { owner_uid, .. }
            | KernelEvent::AgentThought { owner_uid, .. }
            | KernelEvent::AgentAction { owner_uid, .. }
            | KernelEvent::AgentObservation { owner_uid, .. }
            | KernelEvent::AgentProgress { owner_uid, .. }
            | KernelEvent::AgentCompleted { owner_uid, .. }
            | KernelEvent::StepLimitReached { owner_uid, .. }
            | KernelEvent::ContextCompacted { owner_uid, .. }
            | KernelEvent::InjectionBlocked { owner_uid, .. }
            | KernelEvent::MessageReceived { owner_uid, .. } => Some(owner_uid),
            KernelEvent::MemoryStored { agent_uid, .. }
            | KernelEvent::MemoryForgotten { agent_uid, .. } => Some(agent_uid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_tag_matches_topic() {
        let event = KernelEvent::ProcessSpawned {
            pid: 7,
            owner_uid: "u1".into(),
            role: "Greeter".into(),
            goal: "say hello".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.topic());
        assert_eq!(json["pid"], 7);
    }

    #[test]
    fn kernel_events_have_no_owner() {
        let event = KernelEvent::KernelReady {
            version: "0.2.0".into(),
            timestamp: Utc::now(),
        };
        assert!(event.owner_uid().is_none());
        assert!(event.pid().is_none());
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = KernelEvent::AgentObservation {
            pid: 3,
            owner_uid: "u1".into(),
            step: 2,
            success: true,
            output: "ok".into(),
            artifacts: vec!["workspace/report.md".into()],
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: KernelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic(), "agent.observation");
        assert_eq!(back.pid(), Some(3));
    }
}
