// Agent loop
//
// Drives one process from boot through completion. Each step: abort check,
// mailbox drain, compaction check, LLM call, alias normalization, approval
// gate, injection guard, tool dispatch, observation, auto-journal, progress.
// A step is not atomic; kill and pause take effect at phase boundaries.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::error::{KernelError, Result};
use crate::events::KernelEvent;
use crate::guard;
use crate::llm::{parse_text_reply, ChatMessage, ChatRequest, LlmProvider, LlmReply};
use crate::memory::{AgentProfile, MemoryLayer, MemoryRecord, MemoryStore, NewMemory};
use crate::process::ProcessManager;
use crate::sandbox::Sandbox;
use crate::tools::{normalize_alias, ToolContext, ToolRegistry};
use crate::types::{LogKind, Pid, ProcessPhase, ProcessState, RunOutcome, SpawnConfig};

/// Tunables for the loop. Defaults follow the kernel contract; tests shrink
/// the intervals.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Sleep between steps
    pub step_interval: Duration,
    /// Compact every N steps
    pub compact_step_interval: usize,
    /// Compact when the estimated token count exceeds this
    pub compact_token_threshold: usize,
    /// History entries kept verbatim at the tail across compaction
    pub keep_recent: usize,
    /// How long an approval may stay pending before auto-reject
    pub approval_timeout: Duration,
    /// How long a parked loop waits for `agent.continued`
    pub continuation_timeout: Duration,
    /// Observation truncation bound in bytes
    pub observation_limit: usize,
    /// Memories recalled into the system prompt
    pub recall_k: usize,
    /// Poll interval while paused or stopped
    pub pause_poll: Duration,
    /// Consecutive LLM failures tolerated before the process fails
    pub max_llm_failures: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            step_interval: Duration::from_secs(1),
            compact_step_interval: 25,
            compact_token_threshold: 32_000,
            keep_recent: 10,
            approval_timeout: Duration::from_secs(300),
            continuation_timeout: Duration::from_secs(300),
            observation_limit: 8192,
            recall_k: 10,
            pause_poll: Duration::from_millis(200),
            max_llm_failures: 3,
        }
    }
}

impl LoopSettings {
    /// Millisecond-scale intervals for tests
    pub fn fast_for_tests() -> Self {
        Self {
            step_interval: Duration::from_millis(5),
            approval_timeout: Duration::from_secs(2),
            continuation_timeout: Duration::from_millis(500),
            pause_poll: Duration::from_millis(10),
            ..Default::default()
        }
    }
}

enum StepVerdict {
    Continue,
    Exit,
}

/// Per-process executor. Owns nothing shared; talks to the table through the
/// manager by PID.
pub struct AgentRunner {
    pid: Pid,
    owner_uid: String,
    role: String,
    goal: String,
    plan: Option<String>,
    max_steps: usize,
    model: String,
    manager: Arc<ProcessManager>,
    bus: EventBus,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    cheap_provider: Option<Arc<dyn LlmProvider>>,
    memory: Option<Arc<MemoryStore>>,
    sandbox: Arc<dyn Sandbox>,
    clock: Arc<dyn Clock>,
    settings: LoopSettings,
    cancel: CancellationToken,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pid: Pid,
        config: SpawnConfig,
        model: String,
        manager: Arc<ProcessManager>,
        bus: EventBus,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn LlmProvider>,
        cheap_provider: Option<Arc<dyn LlmProvider>>,
        memory: Option<Arc<MemoryStore>>,
        sandbox: Arc<dyn Sandbox>,
        clock: Arc<dyn Clock>,
        settings: LoopSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pid,
            owner_uid: config.owner_uid,
            role: config.role,
            goal: config.goal,
            plan: config.plan,
            max_steps: config.max_steps,
            model,
            manager,
            bus,
            registry,
            provider,
            cheap_provider,
            memory,
            sandbox,
            clock,
            settings,
            cancel,
        }
    }

    /// Run the loop to completion. Fatal errors fail the process; everything
    /// recoverable becomes an observation and costs a step.
    pub async fn run(self) {
        let pid = self.pid;
        match self.drive().await {
            Ok(()) => {}
            Err(KernelError::Cancelled) => {
                debug!(pid, "loop cancelled");
            }
            Err(e) => {
                warn!(pid, error = %e, "loop failed");
            }
        }
    }

    async fn drive(self) -> Result<()> {
        let started = self.clock.now();
        let mut history = vec![
            ChatMessage::system(self.assemble_system_prompt().await),
            ChatMessage::user(format!("Begin working toward your goal: {}", self.goal)),
        ];
        let mut step: usize = 0;
        let mut max_steps = self.max_steps;
        let mut llm_failures: usize = 0;

        loop {
            // 1. Abort check
            if self.cancel.is_cancelled() {
                self.manager.finish(self.pid, RunOutcome::Cancelled).await?;
                return Ok(());
            }
            let Some((state, _)) = self.manager.state_of(self.pid).await else {
                return Ok(());
            };
            if state.is_terminal() {
                return Ok(());
            }

            // 2. Paused or stopped loops idle without consuming a step
            if matches!(
                state,
                ProcessState::Paused | ProcessState::Stopped | ProcessState::Sleeping
            ) {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.pause_poll) => {}
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            }

            // 3. Drain the mailbox into the conversation
            let (user_msgs, ipc_msgs) = self.manager.drain_mailbox(self.pid).await;
            for msg in user_msgs {
                history.push(ChatMessage::user(format!("[User Message] {}", msg.text)));
            }
            for msg in ipc_msgs {
                let payload = match &msg.payload {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                history.push(ChatMessage::user(format!(
                    "[Agent Message from PID {}] ({}) {}",
                    msg.from_pid, msg.channel, payload
                )));
            }

            // 4. Compaction check
            self.maybe_compact(&mut history, step).await;

            // 5. Think
            self.manager.set_phase(self.pid, ProcessPhase::Thinking).await;
            let request = ChatRequest {
                model: self.model.clone(),
                messages: history.clone(),
                tools: self.registry.specs(),
                temperature: None,
                max_tokens: None,
            };
            let reply = self.provider.chat(request, &self.cancel).await;
            let (name, args, thought) = match reply {
                Ok(reply) => {
                    llm_failures = 0;
                    self.interpret_reply(reply)
                }
                Err(KernelError::Cancelled) => continue,
                Err(e) => {
                    llm_failures += 1;
                    if llm_failures >= self.settings.max_llm_failures {
                        warn!(pid = self.pid, error = %e, "llm failure budget exhausted");
                        self.manager
                            .append_log(self.pid, LogKind::System, format!("fatal: {e}"))
                            .await;
                        self.manager.finish(self.pid, RunOutcome::Failed).await?;
                        return Ok(());
                    }
                    history.push(ChatMessage::tool(format!("[Observation] LLM error: {e}")));
                    match self.end_step(&mut step, &mut max_steps, started).await? {
                        StepVerdict::Continue => continue,
                        StepVerdict::Exit => return Ok(()),
                    }
                }
            };

            let current_step = step + 1;
            self.bus.publish(KernelEvent::AgentThought {
                pid: self.pid,
                owner_uid: self.owner_uid.clone(),
                step: current_step,
                thought: thought.clone(),
                timestamp: self.clock.now(),
            });
            self.manager
                .append_log(self.pid, LogKind::Thought, thought)
                .await;
            history.push(ChatMessage::assistant(
                json!({"tool": name, "args": args}).to_string(),
            ));

            // 6. Resolve the tool (aliases first)
            let name = normalize_alias(&name).to_string();
            let Some(tool) = self.registry.get(&name).cloned() else {
                history.push(ChatMessage::tool(format!(
                    "[Observation] Unknown tool `{name}`. Available tools are listed in your instructions."
                )));
                self.observe(current_step, false, format!("Unknown tool `{name}`"), vec![])
                    .await;
                match self.end_step(&mut step, &mut max_steps, started).await? {
                    StepVerdict::Continue => continue,
                    StepVerdict::Exit => return Ok(()),
                }
            };

            // 7. Approval gate
            if tool.requires_approval() {
                self.manager.set_phase(self.pid, ProcessPhase::Waiting).await;
                let rx = self.manager.begin_approval(self.pid, &name, &args).await?;
                let approved = tokio::select! {
                    decision = rx => decision.unwrap_or(false),
                    _ = tokio::time::sleep(self.settings.approval_timeout) => false,
                    _ = self.cancel.cancelled() => {
                        // Approval waits cancel immediately
                        continue;
                    }
                };
                if !approved {
                    let note = format!("Approval was denied for `{name}`; the action was not executed.");
                    history.push(ChatMessage::tool(format!("[Observation] {note}")));
                    self.observe(current_step, false, note, vec![]).await;
                    match self.end_step(&mut step, &mut max_steps, started).await? {
                        StepVerdict::Continue => continue,
                        StepVerdict::Exit => return Ok(()),
                    }
                }
            }

            // 8. Injection guard on the serialized arguments
            let verdict = guard::inspect(&name, &args);
            if !verdict.safe {
                let reason = verdict.reason.unwrap_or_else(|| "blocked".to_string());
                self.bus.publish(KernelEvent::InjectionBlocked {
                    pid: self.pid,
                    owner_uid: self.owner_uid.clone(),
                    tool: name.clone(),
                    reason: reason.clone(),
                    timestamp: self.clock.now(),
                });
                let note = format!("Injection blocked: {reason}");
                history.push(ChatMessage::tool(format!("[Observation] {note}")));
                self.observe(current_step, false, note, vec![]).await;
                match self.end_step(&mut step, &mut max_steps, started).await? {
                    StepVerdict::Continue => continue,
                    StepVerdict::Exit => return Ok(()),
                }
            }

            // 9. Execute
            self.manager.set_phase(self.pid, ProcessPhase::Executing).await;
            self.bus.publish(KernelEvent::AgentAction {
                pid: self.pid,
                owner_uid: self.owner_uid.clone(),
                step: current_step,
                tool: name.clone(),
                args: args.clone(),
                timestamp: self.clock.now(),
            });
            self.manager
                .append_log(self.pid, LogKind::Action, format!("{name} {args}"))
                .await;

            let ctx = ToolContext {
                pid: self.pid,
                owner_uid: self.owner_uid.clone(),
                role: self.role.clone(),
                sandbox: self.sandbox.clone(),
                memory: self.memory.clone(),
                processes: self.manager.clone(),
                cancel: self.cancel.clone(),
            };
            let outcome = tool.execute(args.clone(), &ctx).await;

            // 10. Observe
            self.manager.set_phase(self.pid, ProcessPhase::Observing).await;
            let output = truncate_output(&outcome.output, self.settings.observation_limit);
            history.push(ChatMessage::tool(format!("[Observation] {output}")));
            self.observe(current_step, outcome.success, output.clone(), outcome.artifacts.clone())
                .await;

            // 11. Auto-journal successful non-trivial actions
            if outcome.success && name != "think" {
                self.auto_journal(&name, &output).await;
            }

            // 12. complete ends the run
            if name == "complete" && outcome.success {
                let summary = args
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or(&output)
                    .to_string();
                let duration_ms = (self.clock.now() - started).num_milliseconds();
                self.bus.publish(KernelEvent::AgentCompleted {
                    pid: self.pid,
                    owner_uid: self.owner_uid.clone(),
                    outcome: RunOutcome::Success,
                    steps: current_step,
                    duration_ms,
                    summary: summary.clone(),
                    timestamp: self.clock.now(),
                });
                self.schedule_reflection(summary, current_step);
                self.manager.finish(self.pid, RunOutcome::Success).await?;
                info!(pid = self.pid, steps = current_step, "agent completed");
                return Ok(());
            }

            // 13. Count the step and idle until the next one
            match self.end_step(&mut step, &mut max_steps, started).await? {
                StepVerdict::Continue => {}
                StepVerdict::Exit => return Ok(()),
            }
        }
    }

    /// Normalize an LLM reply into (tool, args, thought)
    fn interpret_reply(&self, reply: LlmReply) -> (String, Value, String) {
        let reply = match reply {
            LlmReply::Text(text) => parse_text_reply(&text),
            other => other,
        };
        match reply {
            LlmReply::ToolCall {
                name,
                arguments,
                reasoning,
            } => {
                let thought = reasoning.unwrap_or_else(|| format!("Using {name}"));
                (name, arguments, thought)
            }
            LlmReply::Text(text) => {
                // Free text becomes a think step so the loop keeps its shape
                ("think".to_string(), json!({ "thought": text.clone() }), text)
            }
        }
    }

    /// Emit `agent.observation` and append the log entry
    async fn observe(&self, step: usize, success: bool, output: String, artifacts: Vec<String>) {
        self.manager
            .append_log(self.pid, LogKind::Observation, output.clone())
            .await;
        self.bus.publish(KernelEvent::AgentObservation {
            pid: self.pid,
            owner_uid: self.owner_uid.clone(),
            step,
            success,
            output,
            artifacts,
            timestamp: self.clock.now(),
        });
    }

    /// Step epilogue: progress event, step-limit parking, inter-step sleep
    async fn end_step(
        &self,
        step: &mut usize,
        max_steps: &mut usize,
        started: chrono::DateTime<chrono::Utc>,
    ) -> Result<StepVerdict> {
        *step += 1;
        self.manager.set_progress(self.pid, *step, *max_steps).await;
        self.bus.publish(KernelEvent::AgentProgress {
            pid: self.pid,
            owner_uid: self.owner_uid.clone(),
            step: *step,
            max_steps: *max_steps,
            timestamp: self.clock.now(),
        });

        if *step >= *max_steps {
            // Register the rendezvous before announcing it, so a client that
            // reacts to the event immediately can already resolve it.
            let rx = self.manager.begin_continuation(self.pid).await?;
            if self.manager.set_state(self.pid, ProcessState::Stopped).await.is_err() {
                return Ok(StepVerdict::Exit);
            }
            self.manager.set_phase(self.pid, ProcessPhase::Waiting).await;
            self.bus.publish(KernelEvent::StepLimitReached {
                pid: self.pid,
                owner_uid: self.owner_uid.clone(),
                steps: *step,
                timestamp: self.clock.now(),
            });
            let granted = tokio::select! {
                extra = rx => extra.ok(),
                _ = tokio::time::sleep(self.settings.continuation_timeout) => None,
                _ = self.cancel.cancelled() => {
                    self.manager.finish(self.pid, RunOutcome::Cancelled).await?;
                    return Ok(StepVerdict::Exit);
                }
            };
            match granted {
                Some(extra) => {
                    *max_steps += extra as usize;
                    self.manager.set_progress(self.pid, *step, *max_steps).await;
                    if self.manager.set_state(self.pid, ProcessState::Running).await.is_err() {
                        return Ok(StepVerdict::Exit);
                    }
                }
                None => {
                    let duration_ms = (self.clock.now() - started).num_milliseconds();
                    self.bus.publish(KernelEvent::AgentCompleted {
                        pid: self.pid,
                        owner_uid: self.owner_uid.clone(),
                        outcome: RunOutcome::Timeout,
                        steps: *step,
                        duration_ms,
                        summary: "step limit reached without continuation".to_string(),
                        timestamp: self.clock.now(),
                    });
                    self.manager.finish(self.pid, RunOutcome::Timeout).await?;
                    return Ok(StepVerdict::Exit);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(self.settings.step_interval) => {}
            _ = self.cancel.cancelled() => {}
        }
        Ok(StepVerdict::Continue)
    }

    /// Record a successful action as an episodic memory
    async fn auto_journal(&self, tool: &str, output: &str) {
        let Some(memory) = &self.memory else { return };
        let importance = if tool == "complete" { 0.8 } else { 0.3 };
        let content = format!("[{}] {tool}: {output}", self.role);
        let content = truncate_output(&content, 500);
        let record = NewMemory {
            agent_uid: self.owner_uid.clone(),
            layer: MemoryLayer::Episodic,
            content,
            tags: vec!["auto-journal".to_string(), tool.to_string()],
            importance,
            expires_at: None,
            source_pid: Some(self.pid),
            related_ids: vec![],
        };
        if let Err(e) = memory.store(record).await {
            warn!(pid = self.pid, error = %e, "auto-journal failed");
        }
    }

    /// Post-completion bookkeeping on its own task; its failure never touches
    /// the exited process.
    fn schedule_reflection(&self, summary: String, steps: usize) {
        let Some(memory) = self.memory.clone() else { return };
        let owner_uid = self.owner_uid.clone();
        let role = self.role.clone();
        let goal = self.goal.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            if let Err(e) = memory.record_completion(&owner_uid, &role, true, steps).await {
                warn!(pid, error = %e, "profile update failed");
            }
            let reflection = NewMemory {
                agent_uid: owner_uid,
                layer: MemoryLayer::Procedural,
                content: format!("Completed \"{goal}\" in {steps} steps. Result: {summary}"),
                tags: vec!["reflection".to_string()],
                importance: 0.6,
                expires_at: None,
                source_pid: Some(pid),
                related_ids: vec![],
            };
            if let Err(e) = memory.store(reflection).await {
                warn!(pid, error = %e, "reflection store failed");
            }
        });
    }

    // ========================================================================
    // System prompt
    // ========================================================================

    async fn assemble_system_prompt(&self) -> String {
        let profile = match &self.memory {
            Some(memory) => memory.get_profile(&self.owner_uid).await.ok().flatten(),
            None => None,
        };
        let memories = match &self.memory {
            Some(memory) => memory
                .memories_for_context(&self.owner_uid, &self.goal, self.settings.recall_k)
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };
        build_system_prompt(
            &self.role,
            &self.goal,
            &self.sandbox.workspace().display().to_string(),
            &self.registry.catalog(),
            profile.as_ref(),
            &memories,
            self.plan.as_deref(),
        )
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    async fn maybe_compact(&self, history: &mut Vec<ChatMessage>, step: usize) {
        let estimated: usize = history.iter().map(ChatMessage::estimated_tokens).sum();
        let due_by_step = step > 0 && step % self.settings.compact_step_interval == 0;
        let due_by_tokens = estimated > self.settings.compact_token_threshold;
        if !(due_by_step || due_by_tokens) {
            return;
        }
        if history.len() <= self.settings.keep_recent + 1 {
            return;
        }

        let middle_len = history.len() - 1 - self.settings.keep_recent;
        let middle = &history[1..1 + middle_len];
        let summary = self
            .summarize(middle)
            .await
            .unwrap_or_else(|| "(summary unavailable)".to_string());

        let folded = fold_history(history, self.settings.keep_recent, step, &summary);
        *history = folded;

        self.bus.publish(KernelEvent::ContextCompacted {
            pid: self.pid,
            owner_uid: self.owner_uid.clone(),
            dropped_entries: middle_len,
            estimated_tokens: estimated,
            timestamp: self.clock.now(),
        });
        debug!(pid = self.pid, dropped = middle_len, "context compacted");
    }

    /// One-paragraph summary from the cheap provider, falling back to the
    /// primary provider, falling back to nothing.
    async fn summarize(&self, middle: &[ChatMessage]) -> Option<String> {
        let transcript: String = middle
            .iter()
            .map(|m| format!("{:?}: {}\n", m.role, m.content))
            .collect();
        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                ChatMessage::system(
                    "Summarize the following agent work history in one paragraph. \
                     Reply with plain text only.",
                ),
                ChatMessage::user(transcript),
            ],
        );

        for provider in [self.cheap_provider.as_ref(), Some(&self.provider)]
            .into_iter()
            .flatten()
        {
            match provider.chat(request.clone(), &self.cancel).await {
                Ok(LlmReply::Text(text)) if !text.trim().is_empty() => return Some(text),
                Ok(_) => continue,
                Err(e) => {
                    debug!(provider = provider.name(), error = %e, "summary attempt failed");
                    continue;
                }
            }
        }
        None
    }
}

/// Replace the middle of a history with a single summary turn, preserving the
/// system prompt and the last `keep_recent` entries bit-for-bit.
pub fn fold_history(
    history: &[ChatMessage],
    keep_recent: usize,
    step: usize,
    summary: &str,
) -> Vec<ChatMessage> {
    let tail_start = history.len() - keep_recent;
    let mut folded = Vec::with_capacity(keep_recent + 2);
    folded.push(history[0].clone());
    folded.push(ChatMessage::user(format!(
        "[Previous work summary, steps 1..{step}] {summary}"
    )));
    folded.extend(history[tail_start..].iter().cloned());
    folded
}

/// Deterministic system prompt assembly. Section order is fixed: identity,
/// environment, tool catalog, rules, profile, recalled memories, plan.
pub fn build_system_prompt(
    role: &str,
    goal: &str,
    workspace: &str,
    catalog: &[String],
    profile: Option<&AgentProfile>,
    memories: &[MemoryRecord],
    plan: Option<&str>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are {role}, an autonomous agent running inside the Aether kernel.\n\
         Your goal: {goal}\n\n"
    ));

    prompt.push_str(&format!(
        "Environment: you operate in an isolated sandbox. Files you place under \
         the shared workspace at {workspace} are visible to the operator and are \
         the way to hand results over.\n\n"
    ));

    prompt.push_str("Available tools:\n");
    for line in catalog {
        prompt.push_str("  ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt.push('\n');

    prompt.push_str(
        "Rules:\n\
         - You work in a think-act-observe loop: reason, invoke exactly one tool, read the result.\n\
         - Calling `complete` ends the session; do it as soon as the goal is met.\n\
         - Always pass concrete arguments. Example call:\n\
           {\"tool\": \"write_file\", \"args\": {\"path\": \"workspace/report.md\", \"content\": \"# Findings\"}}\n\n",
    );

    if let Some(profile) = profile {
        if profile.total_tasks >= 1 {
            prompt.push_str(&format!(
                "Your track record: {} of {} tasks completed successfully across {} steps. \
                 Expertise: {}.\n\n",
                profile.successful_tasks,
                profile.total_tasks,
                profile.total_steps,
                if profile.expertise.is_empty() {
                    "none recorded".to_string()
                } else {
                    profile.expertise.join(", ")
                }
            ));
        }
    }

    if !memories.is_empty() {
        prompt.push_str("Relevant memories:\n");
        for record in memories {
            prompt.push_str(&format!("  - ({:?}) {}\n", record.layer, record.content));
        }
        prompt.push('\n');
    }

    if let Some(plan) = plan {
        prompt.push_str("Active plan:\n");
        prompt.push_str(plan);
        prompt.push('\n');
    }

    prompt
}

/// Truncate on a char boundary, marking the cut
fn truncate_output(output: &str, limit: usize) -> String {
    if output.len() <= limit {
        return output.to_string();
    }
    let mut cut = limit;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated at {limit} bytes]", &output[..cut])
}
