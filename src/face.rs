//! HTTP control surface: status polling, start/stop commands, results and a
//! live event stream. Runs on its own task so a busy loop never blocks it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::queue::{DEFAULT_AGENT_ID, TaskStore};
use crate::state::{AgentEvent, AgentHandle, Command, StateSnapshot};

/// How many ports past the requested one to try before giving up.
const PORT_FALLBACKS: u16 = 10;

#[derive(Clone)]
pub struct AppState {
    pub agent: AgentHandle,
    pub store: Arc<dyn TaskStore>,
    /// Seeded by `start` when the slot is empty.
    pub default_task: String,
    /// Slot that `start` seeds.
    pub agent_id: String,
}

impl AppState {
    pub fn new(agent: AgentHandle, store: Arc<dyn TaskStore>, default_task: impl Into<String>) -> Self {
        Self {
            agent,
            store,
            default_task: default_task.into(),
            agent_id: DEFAULT_AGENT_ID.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                error!(error = %format!("{e:#}"), "control request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": format!("{self:#}") }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
pub struct ControlPayload {
    pub command: String,
    #[serde(default)]
    pub task: Option<String>,
}

impl AgentEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            AgentEvent::Log { line } => Event::default()
                .event("log")
                .data(json!({ "line": line }).to_string()),
            AgentEvent::Status { status } => Event::default()
                .event("status")
                .data(json!({ "status": status }).to_string()),
            AgentEvent::TaskComplete { summary } => Event::default()
                .event("task_complete")
                .data(json!({ "summary": summary }).to_string()),
            AgentEvent::TaskError { message } => Event::default()
                .event("task_error")
                .data(json!({ "message": message }).to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/state", get(state_handler))
        .route("/control", post(control_handler))
        .route("/result/{agent_id}", get(result_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `port`, or the next free one after it, and serve in the background.
pub async fn start_server(port: u16, state: AppState) -> Result<(SocketAddr, JoinHandle<()>)> {
    let mut listener = None;
    for candidate in port..port.saturating_add(PORT_FALLBACKS) {
        match TcpListener::bind(("0.0.0.0", candidate)).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(e) => info!(port = candidate, error = %e, "port unavailable"),
        }
    }
    let listener = listener.ok_or_else(|| {
        anyhow!(
            "could not bind any port in {port}..{}; stop the old agent first",
            port.saturating_add(PORT_FALLBACKS)
        )
    })?;
    let addr = listener.local_addr()?;
    info!("control surface listening on http://{addr}");

    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "control surface stopped");
        }
    });
    Ok((addr, handle))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn state_handler(State(state): State<AppState>) -> Json<StateSnapshot> {
    Json(state.agent.snapshot())
}

async fn control_handler(
    State(state): State<AppState>,
    payload: Result<Json<ControlPayload>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(payload) = payload?;
    let command = match payload.command.trim().to_ascii_lowercase().as_str() {
        "start" => Command::Start {
            task: payload.task.filter(|t| !t.trim().is_empty()),
        },
        "stop" => Command::Stop,
        other => return Err(ApiError::BadRequest(format!("unknown command {other:?}"))),
    };

    if let Command::Start { task } = &command {
        seed_task(&state, task.as_deref())?;
    }
    state.agent.apply(&command);
    info!(?command, "control command applied");
    Ok(Json(json!({ "success": true })))
}

/// An explicit task always overwrites; otherwise only an empty slot is seeded.
fn seed_task(state: &AppState, task: Option<&str>) -> Result<(), ApiError> {
    match task {
        Some(task) => state.store.enqueue(&state.agent_id, task)?,
        None if state.store.peek(&state.agent_id)?.is_none() => {
            state.store.enqueue(&state.agent_id, &state.default_task)?
        }
        None => {}
    }
    Ok(())
}

async fn result_handler(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::BadRequest(format!("invalid agent id {agent_id:?}")));
    }
    match state.store.read_result(&agent_id)? {
        Some(result) => Ok(Json(json!({ "agent_id": agent_id, "result": result }))),
        None => Err(ApiError::NotFound(format!("no result for {agent_id}"))),
    }
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.agent.subscribe();
    // Lagged receivers just skip what they missed.
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Surfer Agent</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 0; }
  header { padding: 16px 24px; border-bottom: 1px solid #1a1a2e; display: flex; gap: 12px; align-items: center; }
  #status { font-weight: 600; }
  main { max-width: 900px; margin: 0 auto; padding: 16px 24px; display: grid; gap: 12px; }
  #log { font-family: monospace; font-size: 13px; background: #111118; padding: 12px; height: 320px; overflow-y: auto; white-space: pre-wrap; }
  #shot { max-width: 100%; border: 1px solid #222; }
  input { flex: 1; background: #111118; border: 1px solid #222; color: #fff; padding: 8px; }
  button { background: #6366f1; color: #fff; border: none; padding: 8px 16px; cursor: pointer; }
  .row { display: flex; gap: 8px; }
</style>
</head>
<body>
  <header><h1>Surfer Agent</h1><span id="status">...</span></header>
  <main>
    <div class="row">
      <input id="task" placeholder="Task (blank keeps the queued or default task)" />
      <button onclick="control('start')">Start</button>
      <button onclick="control('stop')">Stop</button>
    </div>
    <div id="task-now"></div>
    <div id="log"></div>
    <img id="shot" alt="" />
  </main>
<script>
  const logEl = document.getElementById('log');

  async function control(command) {
    const task = document.getElementById('task').value.trim();
    const body = command === 'start' && task ? {command, task} : {command};
    await fetch('/control', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify(body),
    });
  }

  async function refresh() {
    const s = await (await fetch('/state')).json();
    document.getElementById('status').textContent = (s.active ? 'active' : 'inactive') + ' / ' + s.status;
    document.getElementById('task-now').textContent = s.current_task ? 'Task: ' + s.current_task : '';
    logEl.textContent = s.logs.join('\n');
    logEl.scrollTop = logEl.scrollHeight;
    if (s.latest_screenshot) document.getElementById('shot').src = 'data:image/png;base64,' + s.latest_screenshot;
  }

  const es = new EventSource('/events');
  es.addEventListener('log', refresh);
  es.addEventListener('status', refresh);
  refresh();
</script>
</body>
</html>
"##;
