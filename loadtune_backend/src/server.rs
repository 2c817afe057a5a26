use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::output::OutputEvent;
use crate::poller::PollerSnapshot;
use crate::runtime::BackendRuntime;
use crate::session::SessionState;
use crate::tools::{ToolCall, ToolCallResult, ToolDef};

const DEFAULT_TOOL: &str = "set_temperature_load_rate";
const HISTORY_CAP_PER_SESSION: usize = 500;
const HISTORY_MAX_SESSIONS: usize = 1024;

#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<BackendRuntime>,
    pub auth: BackendAuthConfig,
    pub history: Arc<HistoryStore>,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Dialogue lines appended outside the turn/response path, per session.
///
/// Keeps at most `cap` lines per session and `max_sessions` sessions; the
/// session with the stalest last line goes first.
pub struct HistoryStore {
    entries: RwLock<HashMap<String, VecDeque<HistoryEntry>>>,
    cap: usize,
    max_sessions: usize,
}

impl HistoryStore {
    pub fn new(cap: usize, max_sessions: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cap: cap.max(1),
            max_sessions: max_sessions.max(1),
        }
    }

    pub async fn append(&self, session_id: &str, entry: HistoryEntry) {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(session_id) && entries.len() >= self.max_sessions {
            let stalest = entries
                .iter()
                .min_by_key(|(_, lines)| lines.back().map(|line| line.at))
                .map(|(id, _)| id.clone());
            if let Some(stalest) = stalest {
                tracing::debug!("History for session '{}' evicted", stalest);
                entries.remove(&stalest);
            }
        }
        let lines = entries.entry(session_id.to_string()).or_default();
        lines.push_back(entry);
        while lines.len() > self.cap {
            lines.pop_front();
        }
    }

    /// Most recent `limit` entries, oldest first.
    pub async fn recent(&self, session_id: &str, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.read().await;
        let Some(lines) = entries.get(session_id) else {
            return Vec::new();
        };
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
    listeners: usize,
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    tool: Option<String>,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListHistoryQuery {
    limit: Option<usize>,
}

pub async fn serve_backend(
    runtime: BackendRuntime,
    output_rx: flume::Receiver<OutputEvent>,
) -> Result<()> {
    let bind_addr = std::env::var("LOADTUNE_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid LOADTUNE_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);
    let history = Arc::new(HistoryStore::new(
        HISTORY_CAP_PER_SESSION,
        HISTORY_MAX_SESSIONS,
    ));

    let state = Arc::new(ServerState {
        runtime: Arc::new(runtime),
        auth,
        history: history.clone(),
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(output_rx, history, ws_events);

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Loadtune backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/invoke", post(invoke_session))
        .route("/sessions/:id/history", get(list_history))
        .route("/sessions/:id/poller", get(get_poller))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn spawn_event_bridge(
    output_rx: flume::Receiver<OutputEvent>,
    history: Arc<HistoryStore>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = output_rx.recv_async().await {
            record_history(&history, &event).await;
            let _ = ws_events.send(map_output_event(event));
        }
        tracing::debug!("Output channel closed; event bridge stopped");
    });
}

async fn record_history(history: &HistoryStore, event: &OutputEvent) {
    if let OutputEvent::HistoryAppended {
        session_id,
        role,
        text,
        at,
    } = event
    {
        history
            .append(
                session_id,
                HistoryEntry {
                    role: role.clone(),
                    text: text.clone(),
                    at: *at,
                },
            )
            .await;
    }
}

fn map_output_event(event: OutputEvent) -> ApiEventEnvelope {
    match event {
        OutputEvent::HistoryAppended {
            session_id,
            role,
            text,
            ..
        } => envelope(
            "history_appended",
            serde_json::json!({
                "session_id": session_id,
                "role": role,
                "text": text
            }),
        ),
        OutputEvent::Speech { session_id, text, .. } => envelope(
            "speech",
            serde_json::json!({ "session_id": session_id, "text": text }),
        ),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("LOADTUNE_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("LOADTUNE_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "LOADTUNE_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid LOADTUNE_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.runtime.negotiator.store().len().await,
        listeners: state.runtime.listener_count(),
    })
}

async fn list_tools(State(state): State<Arc<ServerState>>) -> Json<Vec<ToolDef>> {
    Json(state.runtime.tool_registry.tool_definitions().await)
}

async fn invoke_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(body): Json<InvokeRequest>,
) -> Result<Json<ToolCallResult>, (StatusCode, String)> {
    let session_id = require_session_id(&session_id)?;
    let call = ToolCall {
        name: body.tool.unwrap_or_else(|| DEFAULT_TOOL.to_string()),
        arguments: body.arguments,
    };
    Ok(Json(state.runtime.invoke_tool(session_id, &call).await))
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionState>, (StatusCode, String)> {
    let session_id = require_session_id(&session_id)?;
    state
        .runtime
        .negotiator
        .store()
        .get(session_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("no negotiation in progress for '{}'", session_id)))
}

async fn list_history(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Query(query): Query<ListHistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, (StatusCode, String)> {
    let session_id = require_session_id(&session_id)?;
    let limit = clamp_limit(query.limit, 100, 1, HISTORY_CAP_PER_SESSION);
    Ok(Json(state.history.recent(session_id, limit).await))
}

async fn get_poller(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<Json<PollerSnapshot>, (StatusCode, String)> {
    let session_id = require_session_id(&session_id)?;
    state
        .runtime
        .negotiator
        .poller(session_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found(format!("no poller has run for '{}'", session_id)))
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();
    let _listener = state.runtime.attach_listener();
    tracing::debug!(
        "Event subscriber connected ({} total)",
        state.runtime.listener_count()
    );

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event subscriber lagged; skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    tracing::debug!("Event subscriber disconnected");
}

fn require_session_id(session_id: &str) -> Result<&str, (StatusCode, String)> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "session id cannot be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}
