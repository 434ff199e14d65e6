// WebSocket client gateway
//
// One socket per session. The read half parses request frames and dispatches
// them; the write half is a dedicated task fed by a channel, so event fan-out
// and responses never interleave partial frames. Subscriptions are additive
// until an explicit unsubscribe and are dropped when the socket closes;
// processes keep running.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use aether_core::{EventBus, KernelEvent, MemoryStore, ProcessManager};
use aether_storage::{AppStore, TokenStore, UserStore};

use crate::auth::{Claims, JwtService};
use crate::handlers;
use crate::protocol::{error_frame, ok_frame, RequestFrame};

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ProcessManager>,
    pub bus: EventBus,
    pub memory: Arc<MemoryStore>,
    pub users: UserStore,
    pub tokens: TokenStore,
    pub apps: AppStore,
    pub jwt: JwtService,
}

/// Whether a session may see an event. Admins see everything; users see
/// their own processes/memories plus ownerless kernel events.
pub fn event_visible(claims: &Claims, event: &KernelEvent) -> bool {
    if claims.role.is_admin() {
        return true;
    }
    event.owner_uid().map_or(true, |owner| owner == claims.sub)
}

/// `GET /ws` upgrade handler; authenticates before switching protocols
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let claims = match state.jwt.verify(&token) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "rejected upgrade: bad token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };
    match state.tokens.is_active(&token).await {
        Ok(true) => {}
        Ok(false) => return (StatusCode::UNAUTHORIZED, "token revoked or unknown").into_response(),
        Err(e) => {
            warn!(error = %e, "token lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "token lookup failed").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: Claims) {
    let session_id = Uuid::now_v7().to_string();
    info!(session = %session_id, uid = %claims.sub, "session connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(128);

    // Dedicated writer; everything outbound goes through this channel
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    send_event(
        &tx,
        &KernelEvent::Connection {
            uid: claims.sub.clone(),
            session_id: session_id.clone(),
            status: "connected".to_string(),
            timestamp: Utc::now(),
        },
    )
    .await;
    send_event(
        &tx,
        &KernelEvent::KernelReady {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        },
    )
    .await;

    // pattern -> forwarder task
    let subscriptions: Arc<Mutex<HashMap<String, JoinHandle<()>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let response =
                    dispatch_frame(&state, &claims, &tx, &subscriptions, &text).await;
                if let Some(response) = response {
                    send_json(&tx, &response).await;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Detach subscriptions; processes keep running
    for (_, task) in subscriptions.lock().await.drain() {
        task.abort();
    }
    drop(tx);
    let _ = writer.await;
    info!(session = %session_id, uid = %claims.sub, "session disconnected");
}

async fn dispatch_frame(
    state: &AppState,
    claims: &Claims,
    tx: &mpsc::Sender<String>,
    subscriptions: &Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    raw: &str,
) -> Option<Value> {
    let frame = match RequestFrame::parse(raw) {
        Ok(frame) => frame,
        Err(e) => {
            // No id to pair with; respond with an unpaired protocol error
            return Some(error_frame("", "invalid_argument", e));
        }
    };

    match frame.kind.as_str() {
        "subscribe" => Some(subscribe(state, claims, tx, subscriptions, &frame).await),
        "unsubscribe" => Some(unsubscribe(subscriptions, &frame).await),
        _ => Some(handlers::handle(state, claims, &frame).await),
    }
}

/// Attach bus subscriptions for the requested topic patterns
async fn subscribe(
    state: &AppState,
    claims: &Claims,
    tx: &mpsc::Sender<String>,
    subscriptions: &Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    frame: &RequestFrame,
) -> Value {
    let Some(topics) = frame.params.get("topics").and_then(Value::as_array) else {
        return error_frame(&frame.id, "invalid_argument", "missing `topics` array");
    };
    let mut attached = Vec::new();
    let mut map = subscriptions.lock().await;
    for topic in topics.iter().filter_map(Value::as_str) {
        if map.contains_key(topic) {
            continue;
        }
        let mut subscription = state.bus.subscribe(topic);
        let claims = claims.clone();
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if event_visible(&claims, &event) {
                    send_event(&tx, &event).await;
                }
            }
        });
        map.insert(topic.to_string(), task);
        attached.push(topic.to_string());
    }
    ok_frame(&frame.id, serde_json::json!({ "subscribed": attached }))
}

async fn unsubscribe(
    subscriptions: &Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    frame: &RequestFrame,
) -> Value {
    let Some(topics) = frame.params.get("topics").and_then(Value::as_array) else {
        return error_frame(&frame.id, "invalid_argument", "missing `topics` array");
    };
    let mut removed = Vec::new();
    let mut map = subscriptions.lock().await;
    for topic in topics.iter().filter_map(Value::as_str) {
        if let Some(task) = map.remove(topic) {
            task.abort();
            removed.push(topic.to_string());
        }
    }
    ok_frame(&frame.id, serde_json::json!({ "unsubscribed": removed }))
}

async fn send_event(tx: &mpsc::Sender<String>, event: &KernelEvent) {
    match serde_json::to_string(event) {
        Ok(frame) => {
            let _ = tx.send(frame).await;
        }
        Err(e) => warn!(error = %e, "failed to serialize event"),
    }
}

async fn send_json(tx: &mpsc::Sender<String>, value: &Value) {
    let _ = tx.send(value.to_string()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_storage::Role;

    fn claims(uid: &str, role: Role) -> Claims {
        Claims {
            sub: uid.to_string(),
            username: uid.to_string(),
            role,
            exp: i64::MAX,
            iat: 0,
        }
    }

    fn owned_event(owner: &str) -> KernelEvent {
        KernelEvent::AgentProgress {
            pid: 1,
            owner_uid: owner.to_string(),
            step: 1,
            max_steps: 4,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn admins_see_everything() {
        let admin = claims("a", Role::Admin);
        assert!(event_visible(&admin, &owned_event("someone-else")));
    }

    #[test]
    fn users_see_only_their_own_processes() {
        let user = claims("u1", Role::User);
        assert!(event_visible(&user, &owned_event("u1")));
        assert!(!event_visible(&user, &owned_event("u2")));
    }

    #[test]
    fn ownerless_kernel_events_are_public() {
        let user = claims("u1", Role::User);
        let event = KernelEvent::KernelReady {
            version: "x".to_string(),
            timestamp: Utc::now(),
        };
        assert!(event_visible(&user, &event));
    }
}
