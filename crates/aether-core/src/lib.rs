// Aether Kernel
//
// This crate is the agent orchestration kernel: process supervision, event
// fan-out, the think-act-observe loop, tool dispatch, and the memory store.
//
// Key design decisions:
// - Storage, LLM access, and isolation are traits (KvStore, LlmProvider,
//   Sandbox) so the kernel runs the same against SQLite, HTTP providers, and
//   containers as against the in-memory test doubles
// - The loop holds only a PID and talks to the table through ProcessManager;
//   there is no Process <-> loop reference cycle
// - One tagged event enum (KernelEvent); the serde tag is the wire topic
// - Time and PID allocation are injected (Clock, PidAllocator) for testability

pub mod agent_loop;
pub mod bus;
pub mod clock;
pub mod error;
pub mod events;
pub mod guard;
pub mod kv;
pub mod llm;
pub mod memory;
pub mod process;
pub mod sandbox;
pub mod scheduler;
pub mod tools;
pub mod types;

// Re-exports for convenience
pub use agent_loop::{build_system_prompt, fold_history, AgentRunner, LoopSettings};
pub use bus::{topic_matches, EventBus, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use clock::{Clock, ManualClock, PidAllocator, SystemClock};
pub use error::{KernelError, Result};
pub use events::KernelEvent;
pub use guard::{inspect as inspect_injection, GuardVerdict};
pub use kv::{KvStore, MemoryKv};
pub use llm::{
    parse_text_reply, ChatMessage, ChatRequest, ChatRole, FixedModel, LlmProvider, LlmReply,
    ScriptedProvider, ToolSpec,
};
pub use memory::{AgentProfile, MemoryLayer, MemoryRecord, MemoryStore, NewMemory, RecallWeights};
pub use process::{ProcessLimits, ProcessManager, RuntimeDeps};
pub use sandbox::{
    ExecResult, FileEntry, LocalSandbox, LocalSandboxFactory, Sandbox, SandboxFactory,
    StubSandbox, StubSandboxFactory,
};
pub use scheduler::ModelRouter;
pub use tools::{normalize_alias, Tool, ToolContext, ToolOutcome, ToolRegistry};
pub use types::{
    IpcMessage, LogEntry, LogKind, Mailbox, Pid, ProcessFilter, ProcessInfo, ProcessPhase,
    ProcessState, RunOutcome, SpawnConfig, UserMessage,
};
