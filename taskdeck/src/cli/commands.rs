//! CLI command implementations.
//!
//! This is a thin client: everything except `serve` goes through the server.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use rand::Rng;
use tracing::debug;

use super::args::{Cli, Commands};
use super::sse::{SseFrame, SseParser};
use crate::config::{Config, ConfigOverrides};
use crate::models::{Message, MessageRole, Session};
use crate::server::{self, Accepted, ErrorBody, SendMessageRequest, Snapshot, TaskSummary};
use crate::session::SessionEvent;

// === Server Client ===

/// HTTP client for a running taskdeck server.
struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(port: u16) -> Self {
        Self {
            base: format!("http://127.0.0.1:{port}"),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .context("Failed to reach server")?;
        let resp = check(resp).await?;
        resp.json().await.context("Failed to parse response")
    }

    async fn post(&self, path: &str, body: Option<&SendMessageRequest>) -> Result<Accepted> {
        let mut req = self.http.post(self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.context("Failed to reach server")?;
        let resp = check(resp).await?;
        resp.json().await.context("Failed to parse response")
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(path))
            .send()
            .await
            .context("Failed to reach server")?;
        check(resp).await?;
        Ok(())
    }
}

/// Turn a non-success response into an error carrying the server's message.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("{} ({status})", body.error),
        Err(_) => bail!("Server returned {status}"),
    }
}

fn session_path(task_id: &str) -> String {
    format!("/api/sessions/{}", urlencoding::encode(task_id))
}

// === Command Execution ===

pub async fn execute(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            open,
            tasks_dir,
            working_dir,
            agent_command,
        } => {
            let config = config.with_overrides(ConfigOverrides {
                port,
                tasks_dir,
                working_dir,
                agent_command,
            });
            server::start_server(config, open).await
        }
        command => {
            let port = server::ensure_server_running(config.port, cli.config.as_deref()).await?;
            run_client_command(&ApiClient::new(port), command).await
        }
    }
}

async fn run_client_command(client: &ApiClient, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { .. } => bail!("serve is not a client command"),
        Commands::Tasks => list_tasks(client).await,
        Commands::Start { task_id } => {
            client
                .post(&format!("{}/start", session_path(&task_id)), None)
                .await?;
            println!("Started session for {task_id}");
            println!("Follow it with: taskdeck watch {task_id}");
            Ok(())
        }
        Commands::Send { task_id, text } => {
            let text = text.join(" ");
            if text.trim().is_empty() {
                bail!("Message is required for send command");
            }
            client
                .post(
                    &format!("{}/messages", session_path(&task_id)),
                    Some(&SendMessageRequest { text }),
                )
                .await?;
            Ok(())
        }
        Commands::Stop { task_id } => {
            client
                .post(&format!("{}/stop", session_path(&task_id)), None)
                .await?;
            println!("Stop requested for {task_id}");
            Ok(())
        }
        Commands::Clear { task_id } => {
            client.delete(&session_path(&task_id)).await?;
            println!("Cleared session for {task_id}");
            Ok(())
        }
        Commands::Sessions => list_sessions(client).await,
        Commands::Show { task_id } => {
            let session: Session = client.get(&session_path(&task_id)).await?;
            print_transcript(&session);
            Ok(())
        }
        Commands::Watch { task_id } => watch(client, task_id.as_deref()).await,
    }
}

async fn list_tasks(client: &ApiClient) -> Result<()> {
    let tasks: Vec<TaskSummary> = client.get("/api/tasks").await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!("{:<24} {:<40} {:<10}", "ID", "TITLE", "SESSION");
    println!("{}", "-".repeat(76));
    for task in tasks {
        let session = if task.active {
            "running"
        } else if task.has_session {
            "idle"
        } else {
            "-"
        };
        println!(
            "{:<24} {:<40} {:<10}",
            truncate(&task.id, 23),
            truncate(&task.title, 39),
            session
        );
    }
    Ok(())
}

async fn list_sessions(client: &ApiClient) -> Result<()> {
    let sessions: Vec<Session> = client.get("/api/sessions").await?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "{:<24} {:<8} {:<9} {:<20}",
        "TASK", "ACTIVE", "MESSAGES", "LAST ACTIVITY"
    );
    println!("{}", "-".repeat(64));
    for session in sessions {
        println!(
            "{:<24} {:<8} {:<9} {:<20}",
            truncate(&session.task_id, 23),
            if session.active { "yes" } else { "no" },
            session.messages.len(),
            session.last_activity_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

fn print_transcript(session: &Session) {
    let state = if session.active { "running" } else { "stopped" };
    println!("== {} ({state}) ==", session.task_id);
    if let Some(ref token) = session.resumption_token {
        println!("resume token: {token}");
    }
    println!();
    for message in &session.messages {
        print_message(message);
        if !message.streaming {
            println!();
        }
    }
}

fn print_message(message: &Message) {
    let role = message.role.as_str().to_uppercase();
    match message.role {
        MessageRole::Assistant if message.streaming => print!("[{role}]:\n{}", message.content),
        _ => println!("[{role}]:\n{}", message.content),
    }
}

// === Watch ===

/// Reconnect delay: exponential with jitter, reset after a good connection.
#[derive(Debug)]
struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// Delay before the next attempt; doubles the base for the one after.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = u64::try_from(base.as_millis() / 4).unwrap_or(0);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        (base + jitter).min(self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Follow the event stream until Ctrl-C, reconnecting with backoff.
async fn watch(client: &ApiClient, task_id: Option<&str>) -> Result<()> {
    let mut url = client.url("/api/events");
    if let Some(id) = task_id {
        url = format!("{url}?task_id={}", urlencoding::encode(id));
    }

    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));
    let mut view = WatchView::default();

    loop {
        let outcome = tokio::select! {
            outcome = follow(client, &url, &mut view, &mut backoff) => outcome,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        match outcome {
            Ok(()) => eprintln!("\n-- stream closed --"),
            Err(e) => eprintln!("\n-- {e:#} --"),
        }

        let delay = backoff.next_delay();
        eprintln!("-- reconnecting in {}ms --", delay.as_millis());
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// One connection: read frames until the server closes the stream.
async fn follow(
    client: &ApiClient,
    url: &str,
    view: &mut WatchView,
    backoff: &mut Backoff,
) -> Result<()> {
    let resp = client
        .http
        .get(url)
        .send()
        .await
        .context("Failed to connect to event stream")?;
    let resp = check(resp).await?;
    backoff.reset();

    let mut body = Box::pin(resp.bytes_stream());
    let mut parser = SseParser::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("Event stream interrupted")?;
        for frame in parser.push(&String::from_utf8_lossy(&chunk)) {
            view.apply(&frame);
        }
    }
    Ok(())
}

/// Client-side copy of the watched sessions, printed as it changes.
#[derive(Debug, Default)]
struct WatchView {
    sessions: HashMap<String, Session>,
}

impl WatchView {
    fn apply(&mut self, frame: &SseFrame) {
        if frame.event == "snapshot" {
            match serde_json::from_str::<Snapshot>(&frame.data) {
                Ok(snapshot) => self.reset(snapshot.sessions),
                Err(e) => debug!(error = %e, "bad snapshot"),
            }
            return;
        }

        match serde_json::from_str::<SessionEvent>(&frame.data) {
            Ok(event) => self.on_event(&event),
            Err(e) => debug!(event = %frame.event, error = %e, "skipping unknown event"),
        }
    }

    /// Replace local state with a fresh snapshot and redraw it.
    fn reset(&mut self, sessions: Vec<Session>) {
        self.sessions.clear();
        for session in sessions {
            print_transcript(&session);
            self.sessions.insert(session.task_id.clone(), session);
        }
    }

    fn on_event(&mut self, event: &SessionEvent) {
        let task_id = event.task_id().to_string();
        let session = self
            .sessions
            .entry(task_id.clone())
            .or_insert_with(|| Session::new(task_id.as_str()));
        session.apply_event(event);

        match event {
            SessionEvent::SessionStarted { resumed, .. } => {
                let how = if *resumed { "resumed" } else { "started" };
                println!("== {task_id}: session {how} ==");
            }
            SessionEvent::Message { message, .. } => print_message(message),
            SessionEvent::Stream { delta, .. } => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            SessionEvent::StreamEnd { .. } => println!("\n"),
            SessionEvent::SessionEnded {
                exit_code, signal, ..
            } => {
                let how = match (exit_code, signal) {
                    (Some(code), _) => format!("exit code {code}"),
                    (None, Some(sig)) => format!("signal {sig}"),
                    (None, None) => "no exit status".to_string(),
                };
                println!("== {task_id}: session ended ({how}) ==");
            }
            SessionEvent::SessionCleared { .. } => {
                self.sessions.remove(&task_id);
                println!("== {task_id}: session cleared ==");
            }
            SessionEvent::Error { error, .. } => eprintln!("!! {task_id}: {error}"),
        }
    }
}
