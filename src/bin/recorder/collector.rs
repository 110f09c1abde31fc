use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use step_recorder::sink::{PUSH_STEP_PATH, RECORDING_STATUS_PATH};
use step_recorder::StatusNotification;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

/// Events streamed to viewers via SSE.
#[derive(Clone, Debug)]
pub enum CollectorEvent {
    NewStep(CollectedStep),
    RecordingStatus(StatusNotification),
}

impl CollectorEvent {
    fn to_sse_event(&self) -> Event {
        match self {
            CollectorEvent::NewStep(step) => Event::default()
                .event("newStep")
                .data(serde_json::to_string(step).unwrap_or_default()),
            CollectorEvent::RecordingStatus(status) => Event::default()
                .event("recordingStatus")
                .data(json!(status).to_string()),
        }
    }
}

pub struct AppState {
    pub event_tx: broadcast::Sender<CollectorEvent>,
    steps_received: AtomicU64,
}

/// A Step as received. Only the fields used for logging are typed; everything
/// else, `elementInfo` included, is relayed untouched whatever its shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectedStep {
    pub id: u64,
    pub action: String,
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct PushStepPayload {
    data: CollectedStep,
}

pub fn router() -> (Router, broadcast::Sender<CollectorEvent>) {
    let (event_tx, _) = broadcast::channel::<CollectorEvent>(64);
    let state = Arc::new(AppState {
        event_tx: event_tx.clone(),
        steps_received: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route(PUSH_STEP_PATH, post(push_step_handler))
        .route(RECORDING_STATUS_PATH, post(recording_status_handler))
        .route("/api/status", get(status_handler))
        .route("/events", get(sse_handler))
        .route(
            "/favicon.ico",
            get(|| async { axum::http::StatusCode::NO_CONTENT }),
        )
        .with_state(state);

    (app, event_tx)
}

/// Bind on `port`, falling back through the next nine ports if it is taken.
pub async fn start_server(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let (app, _) = router();

    let mut listener = None;
    for p in port..port.saturating_add(10) {
        match tokio::net::TcpListener::bind((host, p)).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(e) => debug!(port = p, error = %e, "port unavailable"),
        }
    }
    let listener = listener.ok_or_else(|| {
        anyhow::anyhow!("could not bind any port in {}..{}", port, port.saturating_add(10))
    })?;
    let addr = listener.local_addr()?;

    info!("Collector listening at http://{}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "collector server stopped");
        }
    });

    Ok(addr)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn push_step_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PushStepPayload>,
) -> Json<serde_json::Value> {
    let step = payload.data;
    info!(id = step.id, action = %step.action, url = %step.url, "step received");
    state.steps_received.fetch_add(1, Ordering::Relaxed);
    let _ = state.event_tx.send(CollectorEvent::NewStep(step));
    Json(json!({ "code": 200, "message": "ok" }))
}

async fn recording_status_handler(
    State(state): State<Arc<AppState>>,
    Json(status): Json<StatusNotification>,
) -> Json<serde_json::Value> {
    info!(recording = status.recording, paused = status.paused, "recording status");
    let _ = state.event_tx.send(CollectorEvent::RecordingStatus(status));
    Json(json!({ "code": 200, "message": "ok" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "code": 200,
        "data": {
            "connectedClients": state.event_tx.receiver_count(),
            "stepsReceived": state.steps_received.load(Ordering::Relaxed),
        }
    }))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<CollectorEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Step Collector</title>
<style>
  body { background: #0a0a0f; color: #e0e0e0; font-family: system-ui, sans-serif; margin: 0; }
  header { padding: 16px 24px; border-bottom: 1px solid #1a1a2e; display: flex; gap: 12px; align-items: center; }
  .dot { width: 8px; height: 8px; border-radius: 50%; background: #555; }
  .dot.recording { background: #ef4444; }
  .dot.paused { background: #f59e0b; }
  #log { padding: 16px 24px; display: flex; flex-direction: column; gap: 6px; }
  .entry { padding: 8px 12px; background: #111118; border-left: 3px solid #3b82f6;
           font-family: monospace; font-size: 13px; border-radius: 6px; }
  .num { color: #6366f1; font-weight: 700; margin-right: 8px; }
</style>
</head>
<body>
  <header><div class="dot" id="dot"></div><h1 id="state">idle</h1></header>
  <div id="log"></div>
<script>
  const log = document.getElementById('log');
  const dot = document.getElementById('dot');
  const state = document.getElementById('state');
  const esc = s => String(s).replace(/</g, '&lt;');
  const es = new EventSource('/events');

  es.addEventListener('newStep', e => {
    const s = JSON.parse(e.data);
    const div = document.createElement('div');
    div.className = 'entry';
    div.innerHTML = '<span class="num">#' + s.id + '</span>' + esc(s.action) + ' ' + esc(s.selector || s.url);
    log.appendChild(div);
    while (log.children.length > 50) log.removeChild(log.firstChild);
  });

  es.addEventListener('recordingStatus', e => {
    const s = JSON.parse(e.data);
    const label = s.recording ? (s.paused ? 'paused' : 'recording') : 'stopped';
    state.textContent = label;
    dot.className = 'dot ' + label;
  });
</script>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use step_recorder::{ActionKind, ActionPayload, Step};

    async fn serve() -> (String, broadcast::Sender<CollectorEvent>) {
        let (app, events) = router();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), events)
    }

    #[tokio::test]
    async fn push_step_is_rebroadcast() {
        let (base, events) = serve().await;
        let mut rx = events.subscribe();
        let step = Step {
            sequence_id: 4,
            action: ActionKind::Input,
            url: "https://x.test/".into(),
            page_title: "X".into(),
            timestamp_millis: 9,
            primary_selector: "#q".into(),
            element: None,
            payload: ActionPayload::with_value("rust"),
        };

        let reply: serde_json::Value = reqwest::Client::new()
            .post(format!("{base}{PUSH_STEP_PATH}"))
            .json(&json!({ "action": "step", "data": step }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reply["code"], 200);

        match rx.recv().await.unwrap() {
            CollectorEvent::NewStep(received) => {
                assert_eq!(serde_json::to_value(&received).unwrap(), json!(step))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_endpoint_counts_steps() {
        let (base, _events) = serve().await;
        let client = reqwest::Client::new();
        client
            .post(format!("{base}{RECORDING_STATUS_PATH}"))
            .json(&json!({ "recording": true, "paused": false }))
            .send()
            .await
            .unwrap();
        let status: serde_json::Value = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["data"]["stepsReceived"], 0);
    }

    #[tokio::test]
    async fn malformed_step_is_rejected() {
        let (base, _events) = serve().await;
        let response = reqwest::Client::new()
            .post(format!("{base}{PUSH_STEP_PATH}"))
            .json(&json!({ "action": "step", "data": { "id": "nope" } }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn foreign_element_info_is_relayed_as_is() {
        let (base, events) = serve().await;
        let mut rx = events.subscribe();
        let element = json!({ "tag": "button", "selectors": ["#go", "button:text(\"Go\")"] });

        let response = reqwest::Client::new()
            .post(format!("{base}{PUSH_STEP_PATH}"))
            .json(&json!({
                "action": "step",
                "data": {
                    "id": 1,
                    "action": "click",
                    "url": "https://x.test/",
                    "selector": "#go",
                    "elementInfo": element,
                }
            }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        match rx.recv().await.unwrap() {
            CollectorEvent::NewStep(received) => {
                assert_eq!(received.id, 1);
                assert_eq!(received.rest["elementInfo"], element);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
