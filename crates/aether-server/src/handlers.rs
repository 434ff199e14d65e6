// Request handlers
//
// Each handler validates arguments, applies the authorization rules (admins
// touch anything; users touch what they own), runs the kernel operation, and
// returns exactly one response frame.

use serde_json::{json, Value};
use uuid::Uuid;

use aether_core::{
    KernelError, MemoryLayer, NewMemory, ProcessFilter, ProcessState, SpawnConfig,
};

use crate::auth::Claims;
use crate::gateway::AppState;
use crate::protocol::{error_frame, ok_frame, RequestFrame};

struct HandlerError {
    code: &'static str,
    message: String,
}

impl HandlerError {
    fn forbidden() -> Self {
        Self {
            code: "forbidden",
            message: "not allowed".to_string(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: "invalid_argument",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: "not_found",
            message: message.into(),
        }
    }
}

impl From<KernelError> for HandlerError {
    fn from(error: KernelError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

type HandlerResult = Result<Value, HandlerError>;

/// Route one request frame to its handler
pub async fn handle(state: &AppState, claims: &Claims, frame: &RequestFrame) -> Value {
    let result = match frame.kind.as_str() {
        "process.spawn" => process_spawn(state, claims, frame).await,
        "process.kill" => process_kill(state, claims, frame).await,
        "process.pause" => process_pause(state, claims, frame, true).await,
        "process.resume" => process_pause(state, claims, frame, false).await,
        "process.list" => process_list(state, claims, frame).await,
        "process.logs" => process_logs(state, claims, frame).await,
        "process.send" => process_send(state, claims, frame).await,
        "agent.approve" => resolve_approval(state, claims, frame, true).await,
        "agent.reject" => resolve_approval(state, claims, frame, false).await,
        "agent.continue" => agent_continue(state, claims, frame).await,
        "memory.store" => memory_store(state, claims, frame).await,
        "memory.recall" => memory_recall(state, claims, frame).await,
        "memory.forget" => memory_forget(state, claims, frame).await,
        "memory.profile" => memory_profile(state, claims, frame).await,
        "fs.list" => fs_list(state, claims, frame).await,
        "fs.read" => fs_read(state, claims, frame).await,
        "app.install" => app_install(state, claims, frame).await,
        "app.list" => app_list(state, claims).await,
        "app.set_enabled" => app_set_enabled(state, claims, frame).await,
        "auth.whoami" => auth_whoami(claims),
        "auth.revoke" => auth_revoke(state, frame).await,
        other => Err(HandlerError::invalid(format!("unknown request type: {other}"))),
    };
    match result {
        Ok(data) => ok_frame(&frame.id, data),
        Err(e) => error_frame(&frame.id, e.code, e.message),
    }
}

/// Resolve the target uid: users act as themselves, admins may act for others
fn effective_uid(claims: &Claims, frame: &RequestFrame) -> String {
    match frame.str_param("agent_uid") {
        Some(uid) if claims.role.is_admin() => uid.to_string(),
        _ => claims.sub.clone(),
    }
}

async fn authorize_pid(state: &AppState, claims: &Claims, pid: i64) -> Result<(), HandlerError> {
    if claims.role.is_admin() {
        return Ok(());
    }
    match state.manager.owner_of(pid).await {
        Some(owner) if owner == claims.sub => Ok(()),
        Some(_) => Err(HandlerError::forbidden()),
        None => Err(HandlerError::not_found(format!("no such process: {pid}"))),
    }
}

fn require_pid(frame: &RequestFrame) -> Result<i64, HandlerError> {
    frame
        .i64_param("pid")
        .ok_or_else(|| HandlerError::invalid("missing `pid`"))
}

// ============================================================================
// Processes
// ============================================================================

async fn process_spawn(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let role = frame
        .str_param("role")
        .ok_or_else(|| HandlerError::invalid("missing `role`"))?;
    let goal = frame
        .str_param("goal")
        .ok_or_else(|| HandlerError::invalid("missing `goal`"))?;
    let owner_uid = match frame.str_param("owner_uid") {
        Some(uid) if claims.role.is_admin() => uid.to_string(),
        Some(_) => return Err(HandlerError::forbidden()),
        None => claims.sub.clone(),
    };

    let config = SpawnConfig {
        owner_uid,
        role: role.to_string(),
        goal: goal.to_string(),
        max_steps: frame.u64_param("max_steps").unwrap_or(32) as usize,
        model: frame.str_param("model").map(str::to_string),
        plan: frame.str_param("plan").map(str::to_string),
        parent_pid: None,
    };
    let pid = state.manager.spawn(config).await?;
    Ok(json!({ "pid": pid }))
}

async fn process_kill(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    state.manager.kill(pid).await?;
    Ok(json!({ "pid": pid }))
}

async fn process_pause(
    state: &AppState,
    claims: &Claims,
    frame: &RequestFrame,
    pause: bool,
) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    if pause {
        state.manager.pause(pid).await?;
    } else {
        state.manager.resume(pid).await?;
    }
    Ok(json!({ "pid": pid }))
}

async fn process_list(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let state_filter = frame
        .str_param("state")
        .map(|raw| {
            serde_json::from_value::<ProcessState>(Value::String(raw.to_string()))
                .map_err(|_| HandlerError::invalid(format!("unknown state: {raw}")))
        })
        .transpose()?;
    let filter = ProcessFilter {
        // Non-admins only see their own processes
        owner_uid: if claims.role.is_admin() {
            frame.str_param("owner_uid").map(str::to_string)
        } else {
            Some(claims.sub.clone())
        },
        state: state_filter,
        role: frame.str_param("role").map(str::to_string),
    };
    let processes = state.manager.list(&filter).await;
    Ok(json!({ "processes": processes }))
}

async fn process_logs(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    let limit = frame.u64_param("limit").unwrap_or(100) as usize;
    let logs = state.manager.logs(pid, limit).await?;
    Ok(json!({ "pid": pid, "logs": logs }))
}

async fn process_send(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    let text = frame
        .str_param("text")
        .ok_or_else(|| HandlerError::invalid("missing `text`"))?;
    state.manager.send_user_message(pid, text).await?;
    Ok(json!({ "pid": pid }))
}

// ============================================================================
// Approvals and continuation
// ============================================================================

async fn resolve_approval(
    state: &AppState,
    claims: &Claims,
    frame: &RequestFrame,
    approved: bool,
) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    state.manager.resolve_approval(pid, approved).await?;
    Ok(json!({ "pid": pid, "approved": approved }))
}

async fn agent_continue(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    let extra = frame
        .u64_param("extra_steps")
        .ok_or_else(|| HandlerError::invalid("missing `extra_steps`"))?;
    state.manager.resolve_continuation(pid, extra as u32).await?;
    Ok(json!({ "pid": pid, "extra_steps": extra }))
}

// ============================================================================
// Memory
// ============================================================================

async fn memory_store(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let content = frame
        .str_param("content")
        .ok_or_else(|| HandlerError::invalid("missing `content`"))?;
    let layer = frame
        .str_param("layer")
        .and_then(MemoryLayer::parse)
        .ok_or_else(|| HandlerError::invalid("missing or unknown `layer`"))?;
    let tags = frame
        .params
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
    let importance = frame
        .params
        .get("importance")
        .and_then(Value::as_f64)
        .unwrap_or(0.5);

    let id = state
        .memory
        .store(NewMemory {
            agent_uid: effective_uid(claims, frame),
            layer,
            content: content.to_string(),
            tags,
            importance,
            expires_at: None,
            source_pid: None,
            related_ids: vec![],
        })
        .await?;
    Ok(json!({ "id": id }))
}

async fn memory_recall(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let query = frame
        .str_param("query")
        .ok_or_else(|| HandlerError::invalid("missing `query`"))?;
    let k = frame.u64_param("k").unwrap_or(10) as usize;
    let layer = frame.str_param("layer").and_then(MemoryLayer::parse);
    let records = state
        .memory
        .recall(&effective_uid(claims, frame), query, k, layer)
        .await?;
    Ok(json!({ "records": records }))
}

async fn memory_forget(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let id = frame
        .str_param("id")
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| HandlerError::invalid("missing or invalid `id`"))?;
    match state.memory.get(id).await {
        Some(record) if claims.role.is_admin() || record.agent_uid == claims.sub => {
            state.memory.forget(id).await?;
            Ok(json!({ "id": id }))
        }
        Some(_) => Err(HandlerError::forbidden()),
        None => Err(HandlerError::not_found("no such memory")),
    }
}

async fn memory_profile(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let profile = state
        .memory
        .get_profile(&effective_uid(claims, frame))
        .await?;
    Ok(json!({ "profile": profile }))
}

// ============================================================================
// Workspace reads
// ============================================================================

async fn fs_list(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    let sandbox = state
        .manager
        .sandbox_of(pid)
        .await
        .ok_or_else(|| HandlerError::not_found(format!("no such process: {pid}")))?;
    let path = frame.str_param("path").unwrap_or(".");
    let entries = sandbox.list_dir(path).await?;
    Ok(json!({ "pid": pid, "entries": entries }))
}

async fn fs_read(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let pid = require_pid(frame)?;
    authorize_pid(state, claims, pid).await?;
    let sandbox = state
        .manager
        .sandbox_of(pid)
        .await
        .ok_or_else(|| HandlerError::not_found(format!("no such process: {pid}")))?;
    let path = frame
        .str_param("path")
        .ok_or_else(|| HandlerError::invalid("missing `path`"))?;
    let content = sandbox.read_file(path).await?;
    Ok(json!({ "pid": pid, "path": path, "content": content }))
}

// ============================================================================
// Apps
// ============================================================================

async fn app_install(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let name = frame
        .str_param("name")
        .ok_or_else(|| HandlerError::invalid("missing `name`"))?;
    let manifest = frame.params.get("manifest").cloned().unwrap_or(json!({}));
    let app = state.apps.install(name, &claims.sub, manifest).await?;
    Ok(json!({ "app": app }))
}

async fn app_list(state: &AppState, claims: &Claims) -> HandlerResult {
    let apps = if claims.role.is_admin() {
        state.apps.list_all().await?
    } else {
        state.apps.list_for(&claims.sub).await?
    };
    Ok(json!({ "apps": apps }))
}

async fn app_set_enabled(state: &AppState, claims: &Claims, frame: &RequestFrame) -> HandlerResult {
    let id = frame
        .str_param("id")
        .ok_or_else(|| HandlerError::invalid("missing `id`"))?;
    let enabled = frame
        .params
        .get("enabled")
        .and_then(Value::as_bool)
        .ok_or_else(|| HandlerError::invalid("missing `enabled`"))?;
    match state.apps.get(id).await? {
        Some(app) if claims.role.is_admin() || app.owner_uid == claims.sub => {
            let app = state.apps.set_enabled(id, enabled).await?;
            Ok(json!({ "app": app }))
        }
        Some(_) => Err(HandlerError::forbidden()),
        None => Err(HandlerError::not_found("no such app")),
    }
}

// ============================================================================
// Auth
// ============================================================================

fn auth_whoami(claims: &Claims) -> HandlerResult {
    Ok(json!({
        "uid": claims.sub,
        "username": claims.username,
        "role": claims.role,
    }))
}

async fn auth_revoke(state: &AppState, frame: &RequestFrame) -> HandlerResult {
    let token = frame
        .str_param("token")
        .ok_or_else(|| HandlerError::invalid("missing `token`"))?;
    state.tokens.revoke(token).await?;
    Ok(json!({ "revoked": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtService;
    use aether_core::{
        EventBus, LoopSettings, MemoryKv, MemoryStore, ModelRouter, ProcessLimits, ProcessManager,
        RuntimeDeps, ScriptedProvider, StubSandboxFactory, SystemClock, ToolRegistry,
    };
    use aether_storage::{AppStore, Role, TokenStore, UserStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> (AppState, Arc<ScriptedProvider>) {
        let bus = EventBus::new();
        let clock = Arc::new(SystemClock);
        let kv = MemoryKv::shared();
        let manager = ProcessManager::new(
            bus.clone(),
            clock.clone(),
            Arc::new(StubSandboxFactory::default()),
            ProcessLimits::default(),
        );
        let memory = Arc::new(MemoryStore::new(kv.clone(), clock, bus.clone()));
        let provider = ScriptedProvider::new();
        manager.attach_runtime(RuntimeDeps {
            provider: provider.clone(),
            cheap_provider: None,
            registry: Arc::new(ToolRegistry::with_builtins()),
            memory: Some(memory.clone()),
            router: ModelRouter::default(),
            settings: LoopSettings::fast_for_tests(),
        });
        let state = AppState {
            manager,
            bus,
            memory,
            users: UserStore::new(kv.clone()),
            tokens: TokenStore::new(kv.clone()),
            apps: AppStore::new(kv),
            jwt: JwtService::new("test", chrono::Duration::hours(1)),
        };
        (state, provider)
    }

    fn claims(uid: &str, role: Role) -> Claims {
        Claims {
            sub: uid.to_string(),
            username: uid.to_string(),
            role,
            exp: i64::MAX,
            iat: 0,
        }
    }

    fn frame(kind: &str, params: Value) -> RequestFrame {
        let mut body = params;
        body["type"] = Value::String(kind.to_string());
        body["id"] = Value::String("r1".to_string());
        serde_json::from_value(body).unwrap()
    }

    async fn wait_terminal(state: &AppState, pid: i64) {
        for _ in 0..200 {
            if state.manager.is_terminal(pid).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn spawn_then_list_scopes_by_owner() {
        let (state, _provider) = test_state();
        let alice = claims("alice", Role::User);
        let bob = claims("bob", Role::User);

        let response = handle(
            &state,
            &alice,
            &frame("process.spawn", json!({"role": "Greeter", "goal": "say hello"})),
        )
        .await;
        assert_eq!(response["type"], "response.ok", "{response}");
        let pid = response["data"]["pid"].as_i64().unwrap();

        // Bob's listing does not include Alice's process
        let listing = handle(&state, &bob, &frame("process.list", json!({}))).await;
        assert_eq!(listing["data"]["processes"].as_array().unwrap().len(), 0);

        // An admin sees it
        let admin = claims("root", Role::Admin);
        let listing = handle(&state, &admin, &frame("process.list", json!({}))).await;
        assert!(listing["data"]["processes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|p| p["pid"] == pid));
    }

    #[tokio::test]
    async fn cross_user_kill_is_forbidden() {
        let (state, _provider) = test_state();
        let alice = claims("alice", Role::User);
        let bob = claims("bob", Role::User);

        let response = handle(
            &state,
            &alice,
            &frame("process.spawn", json!({"role": "Worker", "goal": "work", "max_steps": 50})),
        )
        .await;
        let pid = response["data"]["pid"].as_i64().unwrap();

        let denied = handle(&state, &bob, &frame("process.kill", json!({"pid": pid}))).await;
        assert_eq!(denied["type"], "response.error");
        assert_eq!(denied["code"], "forbidden");

        // The owner may kill it
        let allowed = handle(&state, &alice, &frame("process.kill", json!({"pid": pid}))).await;
        assert_eq!(allowed["type"], "response.ok");
        wait_terminal(&state, pid).await;
    }

    #[tokio::test]
    async fn unknown_request_type_is_invalid_argument() {
        let (state, _provider) = test_state();
        let response = handle(
            &state,
            &claims("u", Role::User),
            &frame("process.explode", json!({})),
        )
        .await;
        assert_eq!(response["type"], "response.error");
        assert_eq!(response["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn approval_without_pending_is_an_error() {
        let (state, _provider) = test_state();
        let alice = claims("alice", Role::User);
        let response = handle(
            &state,
            &alice,
            &frame("process.spawn", json!({"role": "Worker", "goal": "work"})),
        )
        .await;
        let pid = response["data"]["pid"].as_i64().unwrap();
        wait_terminal(&state, pid).await;

        let response = handle(&state, &alice, &frame("agent.approve", json!({"pid": pid}))).await;
        assert_eq!(response["type"], "response.error");
    }

    #[tokio::test]
    async fn memory_round_trip_through_handlers() {
        let (state, _provider) = test_state();
        let alice = claims("alice", Role::User);

        let stored = handle(
            &state,
            &alice,
            &frame(
                "memory.store",
                json!({"content": "BM25 is a ranking function", "layer": "semantic", "tags": ["ranking"], "importance": 0.7}),
            ),
        )
        .await;
        assert_eq!(stored["type"], "response.ok", "{stored}");
        let id = stored["data"]["id"].as_str().unwrap().to_string();

        let recalled = handle(
            &state,
            &alice,
            &frame("memory.recall", json!({"query": "BM25", "k": 1})),
        )
        .await;
        let records = recalled["data"]["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["access_count"], 1);

        // Bob cannot forget Alice's memory
        let bob = claims("bob", Role::User);
        let denied = handle(&state, &bob, &frame("memory.forget", json!({"id": id}))).await;
        assert_eq!(denied["code"], "forbidden");

        let removed = handle(&state, &alice, &frame("memory.forget", json!({"id": id}))).await;
        assert_eq!(removed["type"], "response.ok");
    }

    #[tokio::test]
    async fn app_install_and_toggle_with_ownership() {
        let (state, _provider) = test_state();
        let alice = claims("alice", Role::User);
        let bob = claims("bob", Role::User);

        let installed = handle(
            &state,
            &alice,
            &frame("app.install", json!({"name": "dashboard"})),
        )
        .await;
        let app_id = installed["data"]["app"]["id"].as_str().unwrap().to_string();

        let denied = handle(
            &state,
            &bob,
            &frame("app.set_enabled", json!({"id": app_id, "enabled": false})),
        )
        .await;
        assert_eq!(denied["code"], "forbidden");

        let toggled = handle(
            &state,
            &alice,
            &frame("app.set_enabled", json!({"id": app_id, "enabled": false})),
        )
        .await;
        assert_eq!(toggled["data"]["app"]["enabled"], false);
    }

    #[tokio::test]
    async fn whoami_reports_the_session_identity() {
        let (state, _provider) = test_state();
        let response = handle(
            &state,
            &claims("u9", Role::Admin),
            &frame("auth.whoami", json!({})),
        )
        .await;
        assert_eq!(response["data"]["uid"], "u9");
        assert_eq!(response["data"]["role"], "admin");
    }
}
