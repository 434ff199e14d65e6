// Process table entities
//
// ProcessState is the scheduling state machine; ProcessPhase is the advisory
// position inside the think-act-observe loop. The two are orthogonal: phase
// changes are observable but never gate operations.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process identifier: positive, monotonic, never reused
pub type Pid = i64;

/// Scheduling state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Sleeping,
    Stopped,
    Paused,
    Zombie,
    Dead,
}

impl ProcessState {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Zombie | ProcessState::Dead)
    }

    /// Whether the state machine allows moving to `to`
    pub fn can_transition(&self, to: ProcessState) -> bool {
        use ProcessState::*;
        match (self, to) {
            // Terminal states are absorbing, except reaping zombie -> dead
            (Zombie, Dead) => true,
            (Zombie, _) | (Dead, _) => false,
            // Any live state can be killed or complete
            (_, Zombie) => true,
            // Operator pause applies to running or sleeping processes
            (Running, Paused) | (Sleeping, Paused) => true,
            (Paused, Running) => true,
            // Step-limit parks the loop; continuation resumes it
            (Running, Stopped) => true,
            (Stopped, Running) => true,
            // Inter-step idling
            (Running, Sleeping) | (Sleeping, Running) => true,
            _ => false,
        }
    }
}

/// Advisory phase inside the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessPhase {
    Booting,
    Thinking,
    Executing,
    Observing,
    Waiting,
    Completed,
    Failed,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl RunOutcome {
    /// Exit code reported on `process.exit`
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success | RunOutcome::Timeout => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Cancelled => 130,
        }
    }
}

/// Request to spawn a new agent process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Owning user id
    pub owner_uid: String,
    /// Agent role, e.g. "Researcher"
    pub role: String,
    /// Goal the agent works toward
    pub goal: String,
    /// Step budget before the loop parks for continuation
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Model override; routed by role/goal when absent
    #[serde(default)]
    pub model: Option<String>,
    /// Optional plan markdown included in the system prompt
    #[serde(default)]
    pub plan: Option<String>,
    /// PID of the parent agent, for delegated sub-agents
    #[serde(default)]
    pub parent_pid: Option<Pid>,
}

fn default_max_steps() -> usize {
    32
}

/// Snapshot of one process for `process.list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub owner_uid: String,
    pub role: String,
    pub goal: String,
    pub state: ProcessState,
    pub phase: ProcessPhase,
    pub step: usize,
    pub max_steps: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tty_id: Option<String>,
}

/// Filter for `process.list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessFilter {
    #[serde(default)]
    pub owner_uid: Option<String>,
    #[serde(default)]
    pub state: Option<ProcessState>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Kind of a log ring entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Thought,
    Action,
    Observation,
    System,
}

/// One entry in a process's append-only log ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
}

/// Message from the operator to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Message from one agent to another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub from_pid: Pid,
    pub from_uid: String,
    pub channel: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Per-process inbound queues, drained once per loop step
#[derive(Debug, Default)]
pub struct Mailbox {
    pub user_messages: VecDeque<UserMessage>,
    pub ipc_messages: VecDeque<IpcMessage>,
}

impl Mailbox {
    /// Take everything currently queued
    pub fn drain(&mut self) -> (Vec<UserMessage>, Vec<IpcMessage>) {
        (
            self.user_messages.drain(..).collect(),
            self.ipc_messages.drain(..).collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.user_messages.is_empty() && self.ipc_messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for to in [
            ProcessState::Running,
            ProcessState::Paused,
            ProcessState::Stopped,
            ProcessState::Zombie,
        ] {
            assert!(!ProcessState::Dead.can_transition(to));
        }
        assert!(ProcessState::Zombie.can_transition(ProcessState::Dead));
        assert!(!ProcessState::Zombie.can_transition(ProcessState::Running));
    }

    #[test]
    fn pause_resume_round_trip() {
        assert!(ProcessState::Running.can_transition(ProcessState::Paused));
        assert!(ProcessState::Paused.can_transition(ProcessState::Running));
        // A paused process cannot jump straight to stopped
        assert!(!ProcessState::Paused.can_transition(ProcessState::Stopped));
    }

    #[test]
    fn any_live_state_can_become_zombie() {
        for from in [
            ProcessState::Running,
            ProcessState::Sleeping,
            ProcessState::Stopped,
            ProcessState::Paused,
        ] {
            assert!(from.can_transition(ProcessState::Zombie));
        }
    }

    #[test]
    fn mailbox_drain_empties_both_queues() {
        let mut mailbox = Mailbox::default();
        mailbox.user_messages.push_back(UserMessage {
            text: "hi".into(),
            received_at: Utc::now(),
        });
        mailbox.ipc_messages.push_back(IpcMessage {
            from_pid: 1,
            from_uid: "u1".into(),
            channel: "chat".into(),
            payload: serde_json::json!("ping"),
            received_at: Utc::now(),
        });

        let (user, ipc) = mailbox.drain();
        assert_eq!(user.len(), 1);
        assert_eq!(ipc.len(), 1);
        assert!(mailbox.is_empty());
    }
}
