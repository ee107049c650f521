//! Taskdeck server: the session manager behind a JSON API and an SSE stream.
//!
//! Architecture:
//! - One server per user, recorded in ~/.taskdeck (PID/port files)
//! - The server owns the only `SessionManager`; the CLI is a thin client
//!
//! Endpoints:
//! - GET /api/tasks - List tasks
//! - GET /api/sessions - All sessions
//! - GET /api/sessions/{task_id} - One session
//! - GET /api/sessions/{task_id}/active - Whether its agent is running
//! - POST /api/sessions/{task_id}/start - Start or resume the agent
//! - POST /api/sessions/{task_id}/messages - Send a message
//! - POST /api/sessions/{task_id}/stop - Stop the agent
//! - DELETE /api/sessions/{task_id} - Clear the session
//! - GET /api/events - SSE: snapshot, then live session events
//! - GET / - Service description

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::claude::ClaudeLauncher;
use crate::config::{Config, CONFIG_DIR};
use crate::error::SessionError;
use crate::models::Session;
use crate::session::SessionManager;
use crate::tasks::MarkdownTaskStore;

const PID_FILE: &str = "server.pid";
const PORT_FILE: &str = "server.port";

/// Shared server state.
pub struct ServerState {
    manager: SessionManager,
    heartbeat: Duration,
}

impl ServerState {
    pub fn new(manager: SessionManager, heartbeat: Duration) -> Self {
        Self { manager, heartbeat }
    }
}

// === Request/Response Types ===

/// Body of `POST /api/sessions/{task_id}/messages`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

/// Acknowledgement that a request was accepted; the outcome arrives as events.
#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub task_id: String,
}

/// Task listing entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    /// Whether a session (running or not) exists for the task.
    pub has_session: bool,
    pub active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveResponse {
    pub active: bool,
    /// Task currently holding the agent, if any.
    pub active_task_id: Option<String>,
}

/// First event on every SSE connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub sessions: Vec<Session>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub task_id: Option<String>,
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
}

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    Session(SessionError),
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Session(err) => {
                let status = match &err {
                    SessionError::Conflict { .. }
                    | SessionError::Busy(_)
                    | SessionError::NoActiveSession(_) => StatusCode::CONFLICT,
                    SessionError::TaskNotFound(_) => StatusCode::NOT_FOUND,
                    SessionError::TaskSource(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let active_task_id = match &err {
                    SessionError::Conflict { active_task_id } => Some(active_task_id.clone()),
                    _ => None,
                };
                let body = ErrorBody {
                    error: err.to_string(),
                    kind: err.kind().to_string(),
                    active_task_id,
                };
                (status, body)
            }
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: what,
                    kind: "not_found".to_string(),
                    active_task_id: None,
                },
            ),
            Self::BadRequest(why) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: why,
                    kind: "bad_request".to_string(),
                    active_task_id: None,
                },
            ),
            Self::Internal(err) => {
                error!(error = %format!("{err:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: format!("{err:#}"),
                        kind: "internal".to_string(),
                        active_task_id: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

// === Server Lifecycle ===

/// Build the session manager described by `config`.
pub fn build_manager(config: &Config) -> Result<SessionManager> {
    let tasks = Arc::new(MarkdownTaskStore::new(&config.tasks_dir));
    let launcher = Arc::new(ClaudeLauncher::new(config.claude_options()));
    Ok(SessionManager::new(config.manager_config()?, launcher, tasks))
}

/// The API router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/tasks", get(list_tasks))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{task_id}", get(get_session).delete(clear_session))
        .route("/api/sessions/{task_id}/active", get(session_active))
        .route("/api/sessions/{task_id}/start", post(start_session))
        .route("/api/sessions/{task_id}/messages", post(send_message))
        .route("/api/sessions/{task_id}/stop", post(stop_session))
        .route("/api/events", get(events_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server and run until Ctrl-C.
pub async fn start_server(config: Config, open_browser: bool) -> Result<()> {
    let manager = build_manager(&config)?;
    let state = Arc::new(ServerState::new(manager.clone(), config.heartbeat()));

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    let server_dir = get_server_dir()?;
    std::fs::create_dir_all(&server_dir)?;
    std::fs::write(server_dir.join(PID_FILE), std::process::id().to_string())?;
    std::fs::write(server_dir.join(PORT_FILE), config.port.to_string())?;

    info!(%addr, tasks_dir = %config.tasks_dir.display(), "taskdeck server listening");
    println!("Taskdeck server running on http://{addr}");

    if open_browser {
        let _ = open::that(format!("http://{addr}"));
    }

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    manager.shutdown().await;
    let _ = std::fs::remove_file(server_dir.join(PID_FILE));
    let _ = std::fs::remove_file(server_dir.join(PORT_FILE));
    info!("server stopped");

    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn get_server_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(CONFIG_DIR))
}

/// Port of the running server, if there is one.
pub fn get_server_port() -> Option<u16> {
    let server_dir = get_server_dir().ok()?;
    let pid: u32 = std::fs::read_to_string(server_dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if !process_alive(pid) {
        return None;
    }
    std::fs::read_to_string(server_dir.join(PORT_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|pid| kill(Pid::from_raw(pid), None).is_ok())
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Launch `taskdeck serve` in the background.
pub fn spawn_server_daemon(port: u16, config_path: Option<&FsPath>) -> Result<()> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(&exe);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.args(["serve", "--port", &port.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn server daemon")?;

    Ok(())
}

/// Port of the running server, starting one on `port` if needed.
pub async fn ensure_server_running(port: u16, config_path: Option<&FsPath>) -> Result<u16> {
    if let Some(port) = get_server_port() {
        return Ok(port);
    }

    spawn_server_daemon(port, config_path)?;

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(p) = get_server_port() {
            return Ok(p);
        }
    }

    anyhow::bail!("Server failed to start")
}

// === Handlers ===

async fn index_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "taskdeck",
        "version": env!("CARGO_PKG_VERSION"),
        "events": "/api/events",
    }))
}

async fn list_tasks(State(state): State<Arc<ServerState>>) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let tasks = state.manager.tasks().list().await?;
    let active = state.manager.active_task_id();

    let summaries = tasks
        .into_iter()
        .map(|task| TaskSummary {
            has_session: state.manager.get_session(&task.id).is_some(),
            active: active.as_deref() == Some(task.id.as_str()),
            id: task.id,
            title: task.title,
        })
        .collect();
    Ok(Json(summaries))
}

async fn list_sessions(State(state): State<Arc<ServerState>>) -> Json<Vec<Session>> {
    Json(state.manager.get_all_sessions())
}

async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .manager
        .get_session(&task_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no session for task {task_id}")))
}

async fn session_active(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> Json<ActiveResponse> {
    let active_task_id = state.manager.active_task_id();
    Json(ActiveResponse {
        active: active_task_id.as_deref() == Some(task_id.as_str()),
        active_task_id,
    })
}

async fn start_session(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    state.manager.start(&task_id).await?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { task_id })))
}

async fn send_message(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("message text is empty".to_string()));
    }
    state.manager.send_message(&task_id, &req.text)?;
    Ok((StatusCode::ACCEPTED, Json(Accepted { task_id })))
}

async fn stop_session(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Accepted>) {
    state.manager.stop(&task_id);
    (StatusCode::ACCEPTED, Json(Accepted { task_id }))
}

async fn clear_session(
    State(state): State<Arc<ServerState>>,
    Path(task_id): Path<String>,
) -> StatusCode {
    state.manager.clear(&task_id);
    StatusCode::NO_CONTENT
}

async fn events_stream(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (sessions, subscription) = state.manager.subscribe(query.task_id);
    info!(subscriber = subscription.id(), "event stream opened");

    let snapshot = stream::once(async move {
        Ok::<Event, Infallible>(to_sse_event("snapshot", &Snapshot { sessions }))
    });
    let live = subscription.map(|event| Ok::<Event, Infallible>(to_sse_event(event.name(), &event)));

    Sse::new(snapshot.chain(live)).keep_alive(KeepAlive::new().interval(state.heartbeat))
}

fn to_sse_event<T: Serialize>(name: &str, value: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(value)
        .unwrap_or_else(|e| {
            warn!(event = name, error = %e, "failed to encode event");
            Event::default().comment("encode error")
        })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cli::sse::{SseFrame, SseParser};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// Scripted stand-in for the agent: prints a token, then echoes lines.
    const FAKE_AGENT: &str = "#!/bin/sh\n\
        echo \"Session ID: 5e55-10ad\"\n\
        while IFS= read -r line; do\n\
          echo \"echo: $line\"\n\
        done\n";

    struct TestServer {
        _dir: TempDir,
        base: String,
        client: reqwest::Client,
    }

    async fn start_test_server() -> TestServer {
        let dir = TempDir::new().unwrap();
        let tasks_dir = dir.path().join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        std::fs::write(tasks_dir.join("T1.md"), "---\ntitle: First\n---\nDo it.\n").unwrap();
        std::fs::write(tasks_dir.join("T2.md"), "# Second\n").unwrap();

        let agent = dir.path().join("agent.sh");
        std::fs::write(&agent, FAKE_AGENT).unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config {
            agent_command: agent.to_string_lossy().to_string(),
            tasks_dir,
            working_dir: Some(dir.path().to_path_buf()),
            response_idle_ms: 500,
            ..Config::default()
        };
        let manager = build_manager(&config).unwrap();
        let state = Arc::new(ServerState::new(manager, Duration::from_secs(1)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        TestServer {
            _dir: dir,
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }

    impl TestServer {
        async fn post(&self, path: &str) -> reqwest::Response {
            self.client
                .post(format!("{}{path}", self.base))
                .send()
                .await
                .unwrap()
        }
    }

    /// Read SSE frames until one named `until` arrives.
    async fn read_until<S, B>(
        body: &mut S,
        parser: &mut SseParser,
        seen: &mut Vec<SseFrame>,
        until: &str,
    ) where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let read = timeout(Duration::from_secs(10), async {
            loop {
                let chunk = body.next().await.unwrap().unwrap();
                let frames = parser.push(&String::from_utf8_lossy(chunk.as_ref()));
                let done = frames.iter().any(|f| f.event == until);
                seen.extend(frames);
                if done {
                    return;
                }
            }
        })
        .await;
        assert!(read.is_ok(), "no {until} event; saw {seen:?}");
    }

    #[test]
    fn test_session_errors_map_to_status() {
        let cases = [
            (
                SessionError::Conflict {
                    active_task_id: "T1".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (SessionError::Busy("T1".to_string()), StatusCode::CONFLICT),
            (
                SessionError::NoActiveSession("T1".to_string()),
                StatusCode::CONFLICT,
            ),
            (
                SessionError::TaskNotFound("T1".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                SessionError::TaskSource(anyhow::anyhow!("disk gone")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_tasks_and_missing_session() {
        let server = start_test_server().await;

        let tasks: Vec<TaskSummary> = server
            .client
            .get(format!("{}/api/tasks", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "First");
        assert!(!tasks[0].has_session);

        let resp = server
            .client
            .get(format!("{}/api/sessions/T1", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let resp = server.post("/api/sessions/nope/start").await;
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: ErrorBody = resp.json().await.unwrap();
        assert_eq!(body.kind, "task_not_found");

        let resp = server
            .client
            .post(format!("{}/api/sessions/T1/messages", server.base))
            .json(&SendMessageRequest {
                text: "hi".to_string(),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_session_over_http_and_sse() {
        let server = start_test_server().await;

        let resp = server
            .client
            .get(format!("{}/api/events?task_id=T1", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let mut body = Box::pin(resp.bytes_stream());
        let mut parser = SseParser::new();
        let mut seen = Vec::new();

        read_until(&mut body, &mut parser, &mut seen, "snapshot").await;
        let snapshot: Snapshot = serde_json::from_str(&seen[0].data).unwrap();
        assert!(snapshot.sessions.is_empty());

        let resp = server.post("/api/sessions/T1/start").await;
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

        let resp = server.post("/api/sessions/T2/start").await;
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        let body_json: ErrorBody = resp.json().await.unwrap();
        assert_eq!(body_json.kind, "session_conflict");
        assert_eq!(body_json.active_task_id.as_deref(), Some("T1"));

        // The prompt is echoed, then the quiet period ends the reply.
        read_until(&mut body, &mut parser, &mut seen, "stream-end").await;
        let names: Vec<_> = seen.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(&names[..5], &["snapshot", "session-started", "message", "message", "message"]);
        assert!(names.contains(&"stream"));

        let session: Session = server
            .client
            .get(format!("{}/api/sessions/T1", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(session.resumption_token.as_deref(), Some("5e55-10ad"));
        assert!(session.active);
        assert!(session.messages[2].content.contains("echo: You are working on task"));

        let resp = server
            .client
            .post(format!("{}/api/sessions/T1/messages", server.base))
            .json(&SendMessageRequest {
                text: "ping".to_string(),
            })
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

        seen.clear();
        read_until(&mut body, &mut parser, &mut seen, "stream-end").await;
        let streamed: String = seen
            .iter()
            .filter(|f| f.event == "stream")
            .map(|f| serde_json::from_str::<serde_json::Value>(&f.data).unwrap()["delta"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(streamed, "echo: ping\n");

        let resp = server.post("/api/sessions/T1/stop").await;
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        read_until(&mut body, &mut parser, &mut seen, "session-ended").await;

        let active: ActiveResponse = server
            .client
            .get(format!("{}/api/sessions/T1/active", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(!active.active);

        let resp = server
            .client
            .delete(format!("{}/api/sessions/T1", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        read_until(&mut body, &mut parser, &mut seen, "session-cleared").await;

        let sessions: Vec<Session> = server
            .client
            .get(format!("{}/api/sessions", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(sessions.is_empty());
    }
}
