use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use goal_pilot::{LogEntry, RunController, RunStatus};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

/// Commands accepted from the console page.
#[derive(Debug, Clone)]
pub enum ConsoleCommand {
    SetGoal(String),
    Step,
    Run,
    Stop,
    Resume,
    SetModel(String),
    SaveKey(String),
}

impl ConsoleCommand {
    fn from_payload(payload: CommandPayload) -> Option<Self> {
        let value = payload.value.unwrap_or_default();
        match payload.command.trim().to_lowercase().as_str() {
            "goal" => Some(Self::SetGoal(value)),
            "step" => Some(Self::Step),
            "run" => Some(Self::Run),
            "stop" => Some(Self::Stop),
            "resume" => Some(Self::Resume),
            "model" => Some(Self::SetModel(value)),
            "key" => Some(Self::SaveKey(value)),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cmd_tx: mpsc::Sender<ConsoleCommand>,
    pub controller: RunController,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
    value: Option<String>,
}

fn log_event(entry: &LogEntry) -> Event {
    Event::default()
        .event("log")
        .data(serde_json::to_string(entry).unwrap_or_default())
}

fn state_event(status: &RunStatus) -> Event {
    Event::default()
        .event("state")
        .data(serde_json::to_string(status).unwrap_or_default())
}

/// Serve the console on the first free port at or above `port`.
pub async fn start_server(
    controller: RunController,
    port: u16,
) -> Result<mpsc::Receiver<ConsoleCommand>> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<ConsoleCommand>(16);
    let state = Arc::new(AppState { cmd_tx, controller });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/events", get(sse_handler))
        .route("/state", get(state_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    let mut bound = None;
    for p in port..port.saturating_add(10) {
        if let Ok(listener) = tokio::net::TcpListener::bind(format!("127.0.0.1:{p}")).await {
            bound = Some((listener, p));
            break;
        }
    }
    let (listener, port) = bound.ok_or_else(|| {
        anyhow!("could not bind any port in {port}..{}", port.saturating_add(10))
    })?;

    tracing::info!("console running at http://localhost:{port}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("console server stopped: {e}");
        }
    });

    Ok(cmd_rx)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Json<RunStatus> {
    Json(state.controller.status())
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> (axum::http::StatusCode, &'static str) {
    tracing::debug!("POST /command: {}", payload.command);
    match ConsoleCommand::from_payload(payload) {
        Some(command) => {
            let _ = state.cmd_tx.send(command).await;
            (axum::http::StatusCode::OK, "ok")
        }
        None => (axum::http::StatusCode::BAD_REQUEST, "unknown command"),
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading the backlog so nothing falls in between.
    let live = state.controller.journal().subscribe();
    let history = state.controller.journal().recent(50);
    let logs = BroadcastStream::new(live)
        .filter_map(|result| result.ok())
        .map(|entry| log_event(&entry));
    let states = WatchStream::new(state.controller.subscribe()).map(|status| state_event(&status));

    let backlog = tokio_stream::iter(history.into_iter().map(|entry| log_event(&entry)));
    let stream = backlog
        .chain(logs.merge(states))
        .map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Goal Pilot</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 0; }
  header { padding: 16px 24px; border-bottom: 1px solid #1a1a2e; display: flex; gap: 12px; align-items: center; }
  #state { font-size: 13px; color: #888; }
  .main { max-width: 860px; margin: 0 auto; padding: 16px 24px; display: flex; flex-direction: column; gap: 12px; }
  #log { height: 60vh; overflow-y: auto; font-family: monospace; font-size: 13px; }
  .entry { padding: 4px 8px; border-left: 3px solid #333; margin-bottom: 4px; white-space: pre-wrap; }
  .entry.error { border-color: #ef4444; color: #fca5a5; }
  .entry.warning { border-color: #f59e0b; color: #fcd34d; }
  .entry.result { border-color: #22c55e; color: #86efac; }
  .entry.action { border-color: #3b82f6; }
  .entry.model { border-color: #6366f1; color: #a5b4fc; }
  .row { display: flex; gap: 8px; }
  input { flex: 1; background: #111118; border: 1px solid #222; color: #fff; padding: 8px 12px; border-radius: 6px; }
  button { background: #6366f1; color: #fff; border: none; border-radius: 6px; padding: 8px 14px; cursor: pointer; }
  button.warn { background: #b45309; }
</style>
</head>
<body>
  <header><h3>Goal Pilot</h3><span id="state">idle</span></header>
  <div class="main">
    <div class="row">
      <input id="goal" placeholder="Goal..." />
      <button onclick="cmd('goal', document.getElementById('goal').value)">Set goal</button>
    </div>
    <div class="row">
      <button onclick="cmd('step')">Step</button>
      <button onclick="cmd('run')">Run</button>
      <button onclick="cmd('stop')">Stop</button>
      <button class="warn" id="resume" onclick="cmd('resume')" disabled>Confirm &amp; resume</button>
    </div>
    <div id="log"></div>
  </div>
<script>
  const log = document.getElementById('log');
  const stateEl = document.getElementById('state');
  const resume = document.getElementById('resume');

  function cmd(command, value) {
    return fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({command, value}),
    });
  }

  const es = new EventSource('/events');
  es.addEventListener('log', e => {
    const d = JSON.parse(e.data);
    const div = document.createElement('div');
    div.className = 'entry ' + d.kind;
    div.textContent = new Date(d.timestamp).toLocaleTimeString() + '  ' + d.message;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  });
  es.addEventListener('state', e => {
    const s = JSON.parse(e.data);
    stateEl.textContent = s.state + ' · step ' + s.current_step + '/' + s.step_budget + (s.model ? ' · ' + s.model : '');
    resume.disabled = !s.awaiting_safety_confirmation;
  });
</script>
</body>
</html>
"##;
