// Kernel integration tests
// Run with: cargo test -p aether-core --test kernel_test
//
// Exercises the cross-component properties: per-PID event ordering,
// at-most-once delivery for unlagged subscribers, and approval safety.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use aether_core::{
    EventBus, KernelEvent, LoopSettings, ManualClock, MemoryKv, MemoryStore, ModelRouter, Pid,
    ProcessLimits, ProcessManager, RunOutcome, RuntimeDeps, ScriptedProvider, SpawnConfig,
    StubSandboxFactory, Subscription, ToolRegistry,
};

struct Kernel {
    manager: Arc<ProcessManager>,
    bus: EventBus,
    provider: Arc<ScriptedProvider>,
    factory: Arc<StubSandboxFactory>,
}

fn kernel() -> Kernel {
    let bus = EventBus::new();
    let clock = ManualClock::starting_at(Utc::now());
    let factory = Arc::new(StubSandboxFactory::default());
    let manager = ProcessManager::new(
        bus.clone(),
        clock.clone(),
        factory.clone(),
        ProcessLimits::default(),
    );
    let memory = Arc::new(MemoryStore::new(MemoryKv::shared(), clock, bus.clone()));
    let provider = ScriptedProvider::new();
    manager.attach_runtime(RuntimeDeps {
        provider: provider.clone(),
        cheap_provider: None,
        registry: Arc::new(ToolRegistry::with_builtins()),
        memory: Some(memory),
        router: ModelRouter::default(),
        settings: LoopSettings::fast_for_tests(),
    });
    Kernel {
        manager,
        bus,
        provider,
        factory,
    }
}

fn config(role: &str, goal: &str, max_steps: usize) -> SpawnConfig {
    SpawnConfig {
        owner_uid: "u1".to_string(),
        role: role.to_string(),
        goal: goal.to_string(),
        max_steps,
        model: None,
        plan: None,
        parent_pid: None,
    }
}

async fn collect_until_exit(sub: &mut Subscription, pid: Pid) -> Vec<KernelEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::select! {
            ev = sub.recv() => ev,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        let Some(event) = event else { break };
        let done = matches!(&event, KernelEvent::ProcessExit { pid: p, .. } if *p == pid);
        events.push(event);
        if done {
            break;
        }
    }
    events
}

#[tokio::test]
async fn per_step_event_ordering_across_a_multi_step_run() {
    let kernel = kernel();
    let mut sub = kernel.bus.subscribe("*");

    for i in 0..4 {
        kernel
            .provider
            .push_tool("think", json!({"thought": format!("step {i}")}))
            .await;
    }
    kernel
        .provider
        .push_tool("complete", json!({"summary": "done"}))
        .await;

    let pid = kernel.manager.spawn(config("Worker", "multi step", 10)).await.unwrap();
    let events = collect_until_exit(&mut sub, pid).await;

    // Group thought/action/observation/progress indices per step
    let mut per_step: HashMap<usize, [Option<usize>; 4]> = HashMap::new();
    let mut completed_positions = Vec::new();
    for (position, event) in events.iter().enumerate() {
        match event {
            KernelEvent::AgentThought { step, .. } => {
                per_step.entry(*step).or_default()[0] = Some(position)
            }
            KernelEvent::AgentAction { step, .. } => {
                per_step.entry(*step).or_default()[1] = Some(position)
            }
            KernelEvent::AgentObservation { step, .. } => {
                per_step.entry(*step).or_default()[2] = Some(position)
            }
            KernelEvent::AgentProgress { step, .. } => {
                per_step.entry(*step).or_default()[3] = Some(position)
            }
            KernelEvent::AgentCompleted { .. } => completed_positions.push(position),
            _ => {}
        }
    }

    assert_eq!(per_step.len(), 5, "expected 5 steps");
    for (step, slots) in &per_step {
        let thought = slots[0].unwrap_or_else(|| panic!("step {step} missing thought"));
        let action = slots[1].unwrap_or_else(|| panic!("step {step} missing action"));
        let observation = slots[2].unwrap_or_else(|| panic!("step {step} missing observation"));
        assert!(thought < action, "step {step}: thought must precede action");
        assert!(action < observation, "step {step}: action must precede observation");
        if let Some(progress) = slots[3] {
            assert!(observation < progress, "step {step}: observation must precede progress");
        }
    }

    // progress*; completed appears exactly once, after every progress event
    assert_eq!(completed_positions.len(), 1);
    let last_progress = per_step.values().filter_map(|s| s[3]).max().unwrap();
    assert!(completed_positions[0] > last_progress);
}

#[tokio::test]
async fn unlagged_subscribers_get_each_event_exactly_once() {
    let bus = EventBus::new();
    let mut sub = bus.subscribe("agent");

    for step in 0..100 {
        bus.publish(KernelEvent::AgentProgress {
            pid: 1,
            owner_uid: "u1".to_string(),
            step,
            max_steps: 100,
            timestamp: Utc::now(),
        });
    }

    let mut seen = Vec::new();
    while let Some(event) = sub.try_recv() {
        match event {
            KernelEvent::AgentProgress { step, .. } => seen.push(step),
            KernelEvent::SubscriberLagged { .. } => panic!("capacity was never exceeded"),
            other => panic!("unexpected {}", other.topic()),
        }
    }
    let want: Vec<usize> = (0..100).collect();
    assert_eq!(seen, want);
    assert_eq!(sub.dropped(), 0);
}

#[tokio::test]
async fn approved_tools_execute_exactly_once_after_the_approval() {
    let kernel = kernel();
    let mut sub = kernel.bus.subscribe("*");
    kernel
        .provider
        .push_tool("run_command", json!({"command": "echo approved"}))
        .await;

    let pid = kernel
        .manager
        .spawn(config("Admin", "run a command", 5))
        .await
        .unwrap();

    // Nothing executes before the decision
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no approval request seen");
        match sub.try_recv() {
            Some(KernelEvent::ApprovalRequired { tool, .. }) => {
                assert_eq!(tool, "run_command");
                break;
            }
            Some(KernelEvent::AgentAction { tool, .. }) => {
                assert_ne!(tool, "run_command", "action before approval");
            }
            Some(_) => {}
            None => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    let sandbox = kernel.factory.sandbox_for(pid).unwrap();
    assert!(sandbox.commands().await.is_empty());

    kernel.manager.resolve_approval(pid, true).await.unwrap();
    let events = collect_until_exit(&mut sub, pid).await;

    // The action fired exactly once, and only after approval
    let actions = events
        .iter()
        .filter(|e| matches!(e, KernelEvent::AgentAction { tool, .. } if tool == "run_command"))
        .count();
    assert_eq!(actions, 1);
    assert_eq!(sandbox.commands().await, vec!["echo approved".to_string()]);
}

#[tokio::test]
async fn killed_process_exits_and_frees_its_table_slot_to_the_reaper() {
    let kernel = kernel();
    for _ in 0..50 {
        kernel
            .provider
            .push_tool("think", json!({"thought": "spinning"}))
            .await;
    }
    let mut sub = kernel.bus.subscribe("process.exit");

    let pid = kernel.manager.spawn(config("Spinner", "spin", 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    kernel.manager.kill(pid).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("no exit event")
        .unwrap();
    match event {
        KernelEvent::ProcessExit { pid: p, outcome, .. } => {
            assert_eq!(p, pid);
            assert_eq!(outcome, RunOutcome::Cancelled);
        }
        other => panic!("unexpected {}", other.topic()),
    }
    assert!(kernel.manager.is_terminal(pid).await);
}
