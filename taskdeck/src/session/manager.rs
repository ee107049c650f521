//! The session manager: admission control, per-task transcripts, and the
//! pump that turns agent output into session events.
//!
//! All state lives behind one lock. Every transition, including the event it
//! emits, happens while the lock is held, so events for a task reach
//! subscribers in exactly the order the transitions happened.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::broadcaster::{EventBroadcaster, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
use super::events::SessionEvent;
use super::prompt::TaskPrompt;
use crate::claude::{AgentInvocation, AgentLauncher, AgentProcess, OutputFramer};
use crate::error::{Result, SessionError};
use crate::models::{Message, MessageRole, Session};
use crate::process::{OutputStream, ProcessEvent, GRACEFUL_KILL_TIMEOUT};
use crate::tasks::TaskSource;

/// Settings for a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Spawn cwd for every agent run.
    pub working_dir: PathBuf,
    /// Complete a reply after this much silence. `None` waits for exit.
    pub response_idle: Option<Duration>,
    /// Queue length of each event subscriber.
    pub subscriber_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            response_idle: Some(Duration::from_secs(3)),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// The one running agent.
#[derive(Debug)]
struct ActiveRun {
    task_id: String,
    run_id: u64,
    process: Box<dyn AgentProcess>,
    framer: OutputFramer,
    /// The bound message is a reply to a user message.
    awaiting_reply: bool,
    stopping: bool,
    /// An error was already reported for this run.
    errored: bool,
}

#[derive(Debug, Default)]
struct ManagerState {
    sessions: HashMap<String, Session>,
    active: Option<ActiveRun>,
}

impl ManagerState {
    /// The active run, but only if it is still run `run_id`.
    fn run_mut(&mut self, run_id: u64) -> Option<(&mut ActiveRun, &mut Session)> {
        let run = self.active.as_mut().filter(|run| run.run_id == run_id)?;
        let session = self.sessions.get_mut(&run.task_id)?;
        Some((run, session))
    }
}

struct Shared {
    config: ManagerConfig,
    launcher: Arc<dyn AgentLauncher>,
    tasks: Arc<dyn TaskSource>,
    broadcaster: EventBroadcaster,
    state: Mutex<ManagerState>,
    next_run_id: AtomicU64,
    /// Whether an agent is running; lets `shutdown` wait for the exit.
    running: watch::Sender<bool>,
}

/// Owns every session and the single agent slot.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.shared.config)
            .field("active_task_id", &self.active_task_id())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with no sessions.
    pub fn new(
        config: ManagerConfig,
        launcher: Arc<dyn AgentLauncher>,
        tasks: Arc<dyn TaskSource>,
    ) -> Self {
        let broadcaster = EventBroadcaster::new(config.subscriber_buffer);
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                tasks,
                broadcaster,
                state: Mutex::new(ManagerState::default()),
                next_run_id: AtomicU64::new(1),
                running,
            }),
        }
    }

    /// The task source this manager looks tasks up in.
    pub fn tasks(&self) -> &Arc<dyn TaskSource> {
        &self.shared.tasks
    }

    /// Start (or resume) the agent for `task_id`.
    ///
    /// Returns once the run is registered; the agent's replies arrive as
    /// events. Starting the task that is already running is a no-op.
    ///
    /// # Errors
    ///
    /// [`SessionError::Conflict`] if another task is running,
    /// [`SessionError::TaskNotFound`] if the task source does not know the id.
    pub async fn start(&self, task_id: &str) -> Result<()> {
        if self.check_admission(task_id)? {
            return Ok(());
        }

        let task = self
            .shared
            .tasks
            .find(task_id)
            .await
            .map_err(SessionError::TaskSource)?
            .ok_or_else(|| SessionError::TaskNotFound(task_id.to_string()))?;

        let shared = &*self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        // The lock was released during the lookup.
        match &state.active {
            Some(run) if run.task_id == task_id => return Ok(()),
            Some(run) => {
                return Err(SessionError::Conflict {
                    active_task_id: run.task_id.clone(),
                })
            }
            None => {}
        }

        let run_id = shared.next_run_id.fetch_add(1, Ordering::Relaxed);
        let session = state
            .sessions
            .entry(task_id.to_string())
            .or_insert_with(|| Session::new(task_id));
        session.active = true;
        session.started_at = Utc::now();
        session.touch();

        let invocation = AgentInvocation {
            task_id: task_id.to_string(),
            working_dir: shared.config.working_dir.clone(),
            resume_token: session.resumption_token.clone(),
        };
        let (process, events) = shared.launcher.launch(&invocation);
        info!(
            task_id,
            run_id,
            pid = ?process.pid(),
            resumed = invocation.resume_token.is_some(),
            "session started"
        );
        shared.emit(&SessionEvent::SessionStarted {
            task_id: task_id.to_string(),
            resumed: invocation.resume_token.is_some(),
        });

        let mut run = ActiveRun {
            task_id: task_id.to_string(),
            run_id,
            process,
            framer: OutputFramer::new(),
            awaiting_reply: false,
            stopping: false,
            errored: false,
        };

        if invocation.resume_token.is_none() {
            let TaskPrompt { context, prompt } = TaskPrompt::for_task(&task);
            shared.append(session, Message::new(MessageRole::System, context));
            shared.append(session, Message::new(MessageRole::User, prompt.clone()));
            let placeholder = shared.append(session, Message::assistant_placeholder());
            run.framer.bind(placeholder.id);
            run.awaiting_reply = true;

            // A dead process reports itself through its events.
            if let Err(e) = run.process.write(&prompt) {
                debug!(task_id, error = %e, "could not write initial prompt");
            }
        }

        state.active = Some(run);
        shared.running.send_replace(true);
        drop(guard);

        tokio::spawn(pump(self.shared.clone(), task_id.to_string(), run_id, events));
        Ok(())
    }

    /// Returns `Ok(true)` when `task_id` is already the running task.
    fn check_admission(&self, task_id: &str) -> Result<bool> {
        match &self.shared.state.lock().active {
            Some(run) if run.task_id == task_id => Ok(true),
            Some(run) => Err(SessionError::Conflict {
                active_task_id: run.task_id.clone(),
            }),
            None => Ok(false),
        }
    }

    /// Send a user message to the running agent for `task_id`.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoActiveSession`] if `task_id` is not the running task,
    /// [`SessionError::Busy`] while the agent is still answering the previous
    /// message.
    pub fn send_message(&self, task_id: &str, text: &str) -> Result<()> {
        let shared = &*self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        let Some(run) = state.active.as_mut().filter(|run| run.task_id == task_id) else {
            return Err(SessionError::NoActiveSession(task_id.to_string()));
        };
        if run.awaiting_reply && run.framer.target().is_some() {
            return Err(SessionError::Busy(task_id.to_string()));
        }
        let Some(session) = state.sessions.get_mut(task_id) else {
            return Err(SessionError::NoActiveSession(task_id.to_string()));
        };

        // Unprompted output (a resumed agent's banner) ends here.
        if let Some(id) = run.framer.complete_turn() {
            shared.end_message(session, &id);
        }

        shared.append(session, Message::new(MessageRole::User, text));
        let placeholder = shared.append(session, Message::assistant_placeholder());
        run.framer.bind(placeholder.id);
        run.awaiting_reply = true;

        if let Err(e) = run.process.write(text) {
            warn!(task_id, error = %e, "failed to write to agent");
        }
        Ok(())
    }

    /// Ask the running agent for `task_id` to terminate.
    ///
    /// Returns immediately; completion is the `session-ended` event. A no-op
    /// when `task_id` is not running.
    pub fn stop(&self, task_id: &str) {
        let mut state = self.shared.state.lock();
        let Some(run) = state.active.as_mut().filter(|run| run.task_id == task_id) else {
            debug!(task_id, "stop requested for inactive task");
            return;
        };
        if run.stopping {
            return;
        }
        run.stopping = true;
        run.process.kill(GRACEFUL_KILL_TIMEOUT);
        info!(task_id, run_id = run.run_id, "stopping session");
    }

    /// Stop the agent if it belongs to `task_id`, then delete the session.
    ///
    /// The slot is released immediately. Whatever the killed process still
    /// reports is discarded.
    pub fn clear(&self, task_id: &str) {
        let shared = &*self.shared;
        let mut guard = shared.state.lock();
        let state = &mut *guard;
        let mut ended_run = false;

        if state.active.as_ref().is_some_and(|run| run.task_id == task_id) {
            if let Some(mut run) = state.active.take() {
                run.process.kill(GRACEFUL_KILL_TIMEOUT);
                if let Some(session) = state.sessions.get_mut(task_id) {
                    if let Some(id) = run.framer.finish().message_id {
                        shared.end_message(session, &id);
                    }
                }
                shared.emit(&SessionEvent::SessionEnded {
                    task_id: task_id.to_string(),
                    exit_code: None,
                    signal: None,
                });
                shared.running.send_replace(false);
                ended_run = true;
            }
        }

        let removed = state.sessions.remove(task_id).is_some();
        if !removed && !ended_run {
            debug!(task_id, "nothing to clear");
            return;
        }
        info!(task_id, "session cleared");
        shared.emit(&SessionEvent::SessionCleared {
            task_id: task_id.to_string(),
        });
    }

    /// Snapshot of one session.
    pub fn get_session(&self, task_id: &str) -> Option<Session> {
        self.shared.state.lock().sessions.get(task_id).cloned()
    }

    /// Snapshot of every session, sorted by task id.
    pub fn get_all_sessions(&self) -> Vec<Session> {
        let state = self.shared.state.lock();
        sorted_sessions(&state.sessions, None)
    }

    /// Whether the agent is currently running for `task_id`.
    pub fn is_session_active(&self, task_id: &str) -> bool {
        self.active_task_id().as_deref() == Some(task_id)
    }

    /// Task the agent is currently running for.
    pub fn active_task_id(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .active
            .as_ref()
            .map(|run| run.task_id.clone())
    }

    /// Subscribe to events, returning the current sessions as of the moment
    /// of subscription.
    ///
    /// Applying every later event to the snapshot reproduces the manager's
    /// view of those sessions.
    pub fn subscribe(&self, task_filter: Option<String>) -> (Vec<Session>, Subscription) {
        let state = self.shared.state.lock();
        let snapshot = sorted_sessions(&state.sessions, task_filter.as_deref());
        let subscription = self.shared.broadcaster.subscribe(task_filter);
        (snapshot, subscription)
    }

    /// Stop the running agent, if any, and wait for it to exit.
    pub async fn shutdown(&self) {
        let Some(task_id) = self.active_task_id() else {
            return;
        };
        info!(task_id, "shutting down active session");
        self.stop(&task_id);

        let mut running = self.shared.running.subscribe();
        let wait = running.wait_for(|running| !*running);
        if timeout(GRACEFUL_KILL_TIMEOUT + Duration::from_secs(1), wait)
            .await
            .is_err()
        {
            warn!(task_id, "agent did not exit before shutdown deadline");
        }
    }
}

fn sorted_sessions(sessions: &HashMap<String, Session>, task_filter: Option<&str>) -> Vec<Session> {
    let mut out: Vec<Session> = sessions
        .values()
        .filter(|s| task_filter.is_none_or(|id| id == s.task_id))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    out
}

impl Shared {
    fn emit(&self, event: &SessionEvent) {
        self.broadcaster.emit(event);
    }

    /// Append a message to the transcript and announce it.
    fn append(&self, session: &mut Session, message: Message) -> Message {
        let message = session.push(message);
        self.emit(&SessionEvent::Message {
            task_id: session.task_id.clone(),
            message: message.clone(),
        });
        message
    }

    /// Finish a streaming message. Emits `stream-end` at most once per message.
    fn end_message(&self, session: &mut Session, message_id: &str) {
        if session.end_streaming(message_id) {
            self.emit(&SessionEvent::StreamEnd {
                task_id: session.task_id.clone(),
                message_id: message_id.to_string(),
            });
        }
    }

    fn on_output(&self, run_id: u64, text: &str) {
        let mut state = self.state.lock();
        let Some((run, session)) = state.run_mut(run_id) else {
            return;
        };

        if run.framer.target().is_none() {
            let placeholder = self.append(session, Message::assistant_placeholder());
            run.framer.bind(placeholder.id);
        }

        let framed = run.framer.push(text);
        if let Some(token) = framed.token {
            info!(task_id = %session.task_id, run_id, "captured resumption token");
            session.resumption_token = Some(token);
        }
        if let Some(delta) = framed.delta {
            session.append_content(&delta.message_id, &delta.text);
            self.emit(&SessionEvent::Stream {
                task_id: session.task_id.clone(),
                message_id: delta.message_id,
                delta: delta.text,
            });
        }
    }

    fn on_error(&self, run_id: u64, error: String) {
        let mut state = self.state.lock();
        let Some((run, session)) = state.run_mut(run_id) else {
            return;
        };
        run.errored = true;
        self.report_error(session, run_id, &error);
    }

    /// Emit `error` and record it in the transcript as a system message.
    fn report_error(&self, session: &mut Session, run_id: u64, error: &str) {
        warn!(task_id = %session.task_id, run_id, error, "agent error");
        self.emit(&SessionEvent::Error {
            task_id: session.task_id.clone(),
            error: error.to_string(),
        });
        self.append(session, Message::new(MessageRole::System, format!("Error: {error}")));
    }

    /// Whether run `run_id` has a reply in progress that a quiet period may end.
    fn reply_in_progress(&self, run_id: u64) -> bool {
        self.state
            .lock()
            .run_mut(run_id)
            .is_some_and(|(run, _)| run.framer.target_has_output())
    }

    fn complete_reply(&self, run_id: u64) {
        let mut state = self.state.lock();
        let Some((run, session)) = state.run_mut(run_id) else {
            return;
        };
        if !run.framer.target_has_output() {
            return;
        }
        if let Some(id) = run.framer.complete_turn() {
            debug!(task_id = %session.task_id, run_id, message_id = %id, "reply complete");
            self.end_message(session, &id);
        }
        run.awaiting_reply = false;
    }

    fn on_exit(&self, run_id: u64, code: Option<i32>, signal: Option<i32>) {
        let mut state = self.state.lock();
        if !state.active.as_ref().is_some_and(|run| run.run_id == run_id) {
            return;
        }
        let Some(mut run) = state.active.take() else {
            return;
        };

        let finished = run.framer.finish();
        if let Some(session) = state.sessions.get_mut(&run.task_id) {
            // A crash nobody asked for is shown in the transcript.
            if !run.stopping && !run.errored && code != Some(0) {
                let error = match (code, signal) {
                    (Some(code), _) => format!("agent exited unexpectedly with code {code}"),
                    (None, Some(signal)) => format!("agent was killed by signal {signal}"),
                    (None, None) => "agent exited unexpectedly".to_string(),
                };
                self.report_error(session, run_id, &error);
            }
            if let Some(token) = finished.token {
                info!(task_id = %run.task_id, run_id, "captured resumption token");
                session.resumption_token = Some(token);
            }
            if let Some(id) = finished.message_id {
                self.end_message(session, &id);
            }
            session.active = false;
            session.touch();
        }

        info!(task_id = %run.task_id, run_id, ?code, ?signal, "session ended");
        self.emit(&SessionEvent::SessionEnded {
            task_id: run.task_id,
            exit_code: code,
            signal,
        });
        self.running.send_replace(false);
    }
}

/// Apply one run's process events to the manager until the process exits.
async fn pump(
    shared: Arc<Shared>,
    task_id: String,
    run_id: u64,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    loop {
        let next = match shared.config.response_idle {
            Some(idle) if shared.reply_in_progress(run_id) => {
                match timeout(idle, events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        shared.complete_reply(run_id);
                        continue;
                    }
                }
            }
            _ => events.recv().await,
        };

        match next {
            Some(ProcessEvent::Data {
                stream: OutputStream::Stdout,
                text,
            }) => shared.on_output(run_id, &text),
            Some(ProcessEvent::Data {
                stream: OutputStream::Stderr,
                text,
            }) => debug!(task_id, run_id, stderr = %text.trim_end(), "agent stderr"),
            Some(ProcessEvent::Error(error)) => shared.on_error(run_id, error),
            Some(ProcessEvent::Exit(info)) => {
                shared.on_exit(run_id, info.code, info.signal);
                break;
            }
            None => {
                shared.on_exit(run_id, None, None);
                break;
            }
        }
    }
    debug!(task_id, run_id, "pump finished");
}
