// Aether server
//
// Boot order: config -> storage -> kernel (bus, memory, processes) -> HTTP.
// Exit codes: 0 clean shutdown, 1 config error, 2 unrecoverable runtime error.

mod auth;
mod config;
mod gateway;
mod handlers;
mod protocol;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aether_core::{
    EventBus, FixedModel, KernelEvent, LlmProvider, LocalSandboxFactory, LoopSettings, MemoryStore,
    ModelRouter, ProcessLimits, ProcessManager, RuntimeDeps, ScriptedProvider, SystemClock,
    ToolRegistry,
};
use aether_providers::{AnthropicProvider, OpenAiProvider};
use aether_storage::{AppStore, Role, SqliteKv, TokenStore, UserStore};

use crate::auth::JwtService;
use crate::config::{Config, ProviderKind};
use crate::gateway::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "aether_server=info,aether_core=info,aether_storage=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    if let Err(message) = config.validate() {
        error!(%message, "configuration error");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "unrecoverable runtime error");
        std::process::exit(2);
    }
}

async fn run(config: Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

    // Persistence
    let kv = Arc::new(SqliteKv::open(config.data_dir.join("aether.db")).await?);
    let users = UserStore::new(kv.clone());
    let tokens = TokenStore::new(kv.clone());
    let apps = AppStore::new(kv.clone());

    // Kernel
    let bus = EventBus::new();
    let clock = Arc::new(SystemClock);
    let memory = Arc::new(MemoryStore::new(kv.clone(), clock.clone(), bus.clone()));
    let loaded = memory.load().await?;
    info!(records = loaded, "memory store loaded");

    let manager = ProcessManager::new(
        bus.clone(),
        clock,
        Arc::new(LocalSandboxFactory::new(config.data_dir.join("sandboxes"))),
        ProcessLimits::default(),
    );

    let router = ModelRouter::new(&config.default_model, &config.cheap_model);
    let provider = build_provider(&config)?;
    let cheap_provider = Some(FixedModel::new(provider.clone(), router.cheap_model()) as Arc<dyn LlmProvider>);
    manager.attach_runtime(RuntimeDeps {
        provider,
        cheap_provider,
        registry: Arc::new(ToolRegistry::with_builtins()),
        memory: Some(memory.clone()),
        router,
        settings: LoopSettings::default(),
    });
    manager.start_reaper();
    start_memory_sweeper(memory.clone());
    start_metrics_task(bus.clone(), manager.clone(), memory.clone());

    // Auth bootstrap
    bootstrap_admin(&users, &config).await?;
    let jwt_secret = match &config.jwt_secret {
        Some(secret) => secret.clone(),
        None => {
            warn!("AETHER_JWT_SECRET not set; generating an ephemeral secret (sessions will not survive restart)");
            random_secret()
        }
    };
    let jwt = JwtService::new(&jwt_secret, chrono::Duration::hours(12));

    let state = AppState {
        manager,
        bus: bus.clone(),
        memory,
        users,
        tokens,
        apps,
        jwt,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/ws", get(gateway::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "aether server listening");
    bus.publish(KernelEvent::KernelReady {
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    });

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn build_provider(config: &Config) -> Result<Arc<dyn LlmProvider>> {
    let key = config.llm_api_key.clone().unwrap_or_default();
    Ok(match config.llm_provider {
        ProviderKind::Openai => match &config.llm_base_url {
            Some(url) => Arc::new(OpenAiProvider::with_base_url(key, url.clone())?),
            None => Arc::new(OpenAiProvider::new(key)?),
        },
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(key)?),
        ProviderKind::Sim => ScriptedProvider::new(),
    })
}

/// Create the first admin account on an empty store
async fn bootstrap_admin(users: &UserStore, config: &Config) -> Result<()> {
    if !users.is_empty().await? {
        return Ok(());
    }
    let password = match &config.admin_password {
        Some(password) => password.clone(),
        None => {
            let generated = random_secret();
            warn!(password = %generated, "no admin password configured; generated one (change it)");
            generated
        }
    };
    let admin = users.create("admin", &password, Role::Admin).await?;
    info!(uid = %admin.uid, "bootstrap admin account created");
    Ok(())
}

fn random_secret() -> String {
    let bytes: [u8; 24] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Periodic expiry sweep for the memory store
fn start_memory_sweeper(memory: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            ticker.tick().await;
            if let Err(e) = memory.sweep_expired().await {
                warn!(error = %e, "memory sweep failed");
            }
        }
    });
}

/// Periodic `kernel.metrics` publication
fn start_metrics_task(bus: EventBus, manager: Arc<ProcessManager>, memory: Arc<MemoryStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let (running, total) = manager.counts().await;
            bus.publish(KernelEvent::KernelMetrics {
                processes_running: running,
                processes_total: total,
                bus_dropped_events: bus.dropped_events(),
                memory_records: memory.len().await,
                timestamp: Utc::now(),
            });
        }
    });
}

// ============================================================================
// HTTP handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
    expires_at: chrono::DateTime<Utc>,
    uid: String,
    role: Role,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, StatusCode> {
    let user = state
        .users
        .authenticate(&request.username, &request.password)
        .await
        .map_err(|e| {
            error!(error = %e, "login lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let (token, expires_at) = state
        .jwt
        .issue(&user.uid, &user.username, user.role)
        .map_err(|e| {
            error!(error = %e, "token issue failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    state
        .tokens
        .record(&token, &user.uid, expires_at)
        .await
        .map_err(|e| {
            error!(error = %e, "token record failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    info!(uid = %user.uid, "login");
    Ok(Json(LoginResponse {
        token,
        expires_at,
        uid: user.uid,
        role: user.role,
    }))
}
