//! HTTP surface: job submission, control, inspection and the SSE event feed,
//! plus a small single-page UI.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::config::ServerConfig;
use crate::error::{AgentError, Result};
use crate::job::{JobOverview, JobSnapshot};
use crate::orchestrator::Orchestrator;
use crate::persona::Persona;
use crate::types::{ControlCommand, JobEvent, JobId, JobRequest, JobStatus};

const KEEP_ALIVE: Duration = Duration::from_secs(15);
const PORT_FALLBACKS: u16 = 10;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlPayload {
    pub command: ControlCommand,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match &self {
            AgentError::JobNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(|| async { Json(serde_json::json!({ "status": "ok" })) }))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .route("/api/personas", get(personas_handler))
        .route("/api/jobs", get(list_handler).post(submit_handler))
        .route("/api/jobs/{id}", get(snapshot_handler))
        .route("/api/jobs/{id}/control", post(control_handler))
        .route("/api/jobs/{id}/events", get(events_handler))
        .with_state(state)
}

/// Bind the configured address, falling back to the next few ports if it is
/// taken, and serve until the process exits.
pub async fn serve(orchestrator: Orchestrator, config: &ServerConfig) -> Result<()> {
    let mut last_err = None;
    for port in config.port..config.port.saturating_add(PORT_FALLBACKS) {
        match TcpListener::bind((config.bind.as_str(), port)).await {
            Ok(listener) => {
                tracing::info!("web UI running at http://{}:{}", config.bind, port);
                let app = router(AppState { orchestrator });
                axum::serve(listener, app).await?;
                return Ok(());
            }
            Err(err) => {
                tracing::debug!(port, error = %err, "port unavailable");
                last_err = Some(err);
            }
        }
    }
    Err(AgentError::Config(format!(
        "could not bind {} on ports {}..{}: {}",
        config.bind,
        config.port,
        config.port.saturating_add(PORT_FALLBACKS),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn personas_handler(State(state): State<AppState>) -> Json<Vec<Persona>> {
    Json(state.orchestrator.personas().all().to_vec())
}

async fn submit_handler(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    let job_id = state.orchestrator.submit(request)?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

async fn list_handler(State(state): State<AppState>) -> Json<Vec<JobOverview>> {
    Json(
        state
            .orchestrator
            .list()
            .iter()
            .map(|job| job.overview())
            .collect(),
    )
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Json<JobSnapshot>> {
    Ok(Json(state.orchestrator.get(id)?.snapshot()))
}

async fn control_handler(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Json(payload): Json<ControlPayload>,
) -> Result<Json<ControlResponse>> {
    let status = state.orchestrator.control(id, payload.command)?;
    Ok(Json(ControlResponse { job_id: id, status }))
}

async fn events_handler(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let events = state.orchestrator.attach(id)?;
    let stream = UnboundedReceiverStream::new(events).map(|event| Ok(to_sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

fn to_sse_event(event: &JobEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|err| {
        serde_json::json!({ "type": "error", "message": err.to_string() }).to_string()
    });
    Event::default().event(event.kind()).data(data)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Persona Pilot</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    min-height: 100vh;
  }
  header {
    padding: 24px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  #status { font-size: 13px; color: #888; margin-left: auto; }
  .main { max-width: 900px; margin: 0 auto; padding: 24px 32px; display: flex; flex-direction: column; gap: 16px; }
  form { display: grid; grid-template-columns: 2fr 2fr 1fr 80px auto; gap: 8px; align-items: center; }
  input, select {
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 10px 12px;
    color: #fff;
    font-size: 14px;
  }
  label { font-size: 13px; color: #aaa; }
  .controls { display: flex; gap: 8px; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 10px 18px;
    font-size: 14px;
    font-weight: 600;
    cursor: pointer;
  }
  button:hover { background: #4f46e5; }
  button:disabled { background: #333; cursor: not-allowed; }
  #log { display: flex; flex-direction: column; gap: 8px; }
  .entry { padding: 10px 14px; border-radius: 8px; font-size: 13px; line-height: 1.5; background: #111118; border-left: 3px solid #3b82f6; }
  .entry h3 { font-size: 14px; color: #fff; margin-bottom: 4px; }
  .entry pre { white-space: pre-wrap; font-family: 'Cascadia Code', 'Fira Code', monospace; }
  .entry img { max-width: 100%; margin-top: 8px; border-radius: 4px; }
  .entry.error { background: #1a0a0a; border-left-color: #ef4444; color: #fca5a5; }
  .entry.done { background: #0a1a0a; border-left-color: #22c55e; color: #86efac; }
</style>
</head>
<body>
  <header>
    <h1>Persona Pilot</h1>
    <span id="status">idle</span>
  </header>
  <div class="main">
    <form id="job" onsubmit="start(event)">
      <input id="url" placeholder="https://shop.example.com" required />
      <input id="goal" placeholder="find a winter jacket" required />
      <select id="persona"></select>
      <input id="steps" type="number" min="1" value="10" />
      <label><input id="debug" type="checkbox" /> debug</label>
    </form>
    <div class="controls">
      <button form="job" type="submit" id="start">Start</button>
      <button id="pause" onclick="control('pause')" disabled>Pause</button>
      <button id="resume" onclick="control('resume')" disabled>Resume</button>
      <button id="stop" onclick="control('stop')" disabled>Stop</button>
    </div>
    <div id="log"></div>
  </div>
<script>
  const log = document.getElementById('log');
  const statusEl = document.getElementById('status');
  let jobId = null;
  let es = null;

  const esc = s => String(s).replace(/&/g,'&amp;').replace(/</g,'&lt;');

  fetch('/api/personas').then(r => r.json()).then(list => {
    const sel = document.getElementById('persona');
    list.forEach(p => {
      const o = document.createElement('option');
      o.value = p.name; o.textContent = p.name; o.title = p.description;
      sel.appendChild(o);
    });
  });

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    window.scrollTo(0, document.body.scrollHeight);
  }

  function addStep(step) {
    let html = '<h3>' + esc(step.title) + '</h3><pre>' + esc(step.lines.join('\n')) + '</pre>';
    if (step.image) html += '<img src="data:image/png;base64,' + step.image + '" />';
    addEntry('step', html);
  }

  function setStatus(s) {
    statusEl.textContent = s;
    const live = s === 'running' || s === 'paused';
    document.getElementById('start').disabled = live;
    document.getElementById('pause').disabled = s !== 'running';
    document.getElementById('resume').disabled = s !== 'paused';
    document.getElementById('stop').disabled = !live;
  }

  async function start(e) {
    e.preventDefault();
    const body = {
      url: document.getElementById('url').value,
      goal: document.getElementById('goal').value,
      persona: document.getElementById('persona').value,
      max_steps: parseInt(document.getElementById('steps').value, 10),
      debug: document.getElementById('debug').checked,
    };
    const res = await fetch('/api/jobs', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify(body),
    });
    const data = await res.json();
    if (!res.ok) { addEntry('error', esc(data.error)); return; }
    jobId = data.job_id;
    log.innerHTML = '';
    listen();
  }

  async function control(command) {
    if (!jobId) return;
    const res = await fetch('/api/jobs/' + jobId + '/control', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command}),
    });
    const data = await res.json();
    if (res.ok) setStatus(data.status);
  }

  function listen() {
    if (es) es.close();
    es = new EventSource('/api/jobs/' + jobId + '/events');
    es.addEventListener('history', e => {
      const d = JSON.parse(e.data);
      log.innerHTML = '';
      d.steps.forEach(addStep);
      setStatus(d.status);
    });
    es.addEventListener('step', e => addStep(JSON.parse(e.data).step));
    es.addEventListener('status', e => {
      const d = JSON.parse(e.data);
      setStatus(d.status);
      if (d.summary) addEntry('done', '<strong>Summary:</strong> ' + esc(d.summary));
      if (d.status === 'completed' || d.status === 'stopped' || d.status === 'error') es.close();
    });
    es.addEventListener('error', e => {
      if (!e.data) return;
      addEntry('error', '<strong>Error:</strong> ' + esc(JSON.parse(e.data).message));
    });
  }

  setStatus('idle');
</script>
</body>
</html>
"##;
