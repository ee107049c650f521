//! Supervised handle over one running agent process.
//!
//! A [`ProcessHandle`] owns the child exclusively through a background
//! supervisor task. Callers talk to it through two channels: lines for stdin
//! and kill requests. Everything the process does comes back as an ordered
//! stream of [`ProcessEvent`]s:
//!
//! - `Data` chunks, raw and unframed, in the order they were read
//! - `Error` for spawn or pipe failures
//! - exactly one `Exit`, always last

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::options::ProcessOptions;
use crate::error::ProcessError;

/// Grace period between the termination signal and the forced kill.
pub const GRACEFUL_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for pipe readers to drain after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUFFER_SIZE: usize = 4096;

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when the process was killed (unix only).
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// Whether the process exited with status zero.
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Event emitted by a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of decoded output.
    Data {
        /// Source pipe.
        stream: OutputStream,
        /// Decoded text; never splits a UTF-8 sequence.
        text: String,
    },
    /// A spawn or pipe failure.
    Error(String),
    /// The process is gone. Always the final event.
    Exit(ExitInfo),
}

/// Handle to a running (or failed-to-start) process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<String>,
    kill_tx: mpsc::UnboundedSender<Duration>,
}

impl ProcessHandle {
    /// Spawn a process and start supervising it.
    ///
    /// Never fails synchronously: a launch failure is delivered as an
    /// `Error` event followed by an `Exit` with neither code nor signal.
    /// Must be called from within a tokio runtime.
    pub fn spawn(options: &ProcessOptions) -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let mut child = match options.to_command().spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = ProcessError::Spawn {
                    program: options.program.clone(),
                    source,
                };
                warn!(program = %options.program, error = %err, "agent failed to launch");
                let _ = event_tx.send(ProcessEvent::Error(err.to_string()));
                let _ = event_tx.send(ProcessEvent::Exit(ExitInfo::default()));
                let handle = Self {
                    pid: None,
                    stdin_tx,
                    kill_tx,
                };
                return (handle, event_rx);
            }
        };

        let pid = child.id();
        debug!(program = %options.program, ?pid, args = ?options.args, "spawned process");

        let stdin = child.stdin.take();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                stdout,
                OutputStream::Stdout,
                event_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                stderr,
                OutputStream::Stderr,
                event_tx.clone(),
            )));
        }

        tokio::spawn(supervise(child, stdin, stdin_rx, kill_rx, readers, event_tx));

        let handle = Self {
            pid,
            stdin_tx,
            kill_tx,
        };
        (handle, event_rx)
    }

    /// OS process id, if the process was launched.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Write `text` plus a trailing newline to the process's stdin.
    pub fn write(&self, text: &str) -> Result<(), ProcessError> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.stdin_tx.send(line).map_err(|_| ProcessError::Exited)
    }

    /// Ask the process to terminate, forcing a kill after `graceful_timeout`.
    ///
    /// Returns immediately; the exit is observed through the event stream.
    /// Repeated calls while a termination is pending are ignored.
    pub fn kill(&self, graceful_timeout: Duration) {
        if self.kill_tx.send(graceful_timeout).is_err() {
            debug!(pid = ?self.pid, "kill requested for a process that already exited");
        }
    }
}

async fn supervise(
    mut child: Child,
    stdin: Option<ChildStdin>,
    stdin_rx: mpsc::UnboundedReceiver<String>,
    mut kill_rx: mpsc::UnboundedReceiver<Duration>,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let writer = stdin.map(|stdin| tokio::spawn(write_stdin(stdin, stdin_rx, events.clone())));

    let status = wait_with_escalation(&mut child, &mut kill_rx).await;

    // Once the writer is gone, further writes report `Exited`.
    if let Some(writer) = writer {
        writer.abort();
        let _ = writer.await;
    }

    // Output written just before exit must be delivered before the exit event.
    for mut reader in readers {
        if timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            warn!(pid = ?child.id(), "output pipe still open after exit, abandoning reader");
            reader.abort();
        }
    }

    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            let _ = events.send(ProcessEvent::Error(format!("failed to wait for process: {e}")));
            ExitInfo::default()
        }
    };
    debug!(code = ?info.code, signal = ?info.signal, "process exited");
    let _ = events.send(ProcessEvent::Exit(info));
}

async fn wait_with_escalation(
    child: &mut Child,
    kill_rx: &mut mpsc::UnboundedReceiver<Duration>,
) -> io::Result<ExitStatus> {
    let mut deadline: Option<Instant> = None;
    let mut escalated = false;

    loop {
        let escalate_at = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            status = child.wait() => return status,
            Some(grace) = kill_rx.recv(), if deadline.is_none() => {
                terminate(child);
                deadline = Some(Instant::now() + grace);
            }
            () = tokio::time::sleep_until(escalate_at), if deadline.is_some() && !escalated => {
                warn!(pid = ?child.id(), "process ignored termination, killing");
                escalated = true;
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill process");
                }
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill process");
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    while let Some(line) = lines.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            let _ = events.send(ProcessEvent::Error(format!("failed writing to stdin: {e}")));
            break;
        }
    }
}

async fn read_stream<R>(mut reader: R, stream: OutputStream, events: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Decoder::default();

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() && events.send(ProcessEvent::Data { stream, text }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(ProcessEvent::Error(format!("failed reading {stream}: {e}")));
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(ProcessEvent::Data { stream, text: rest });
    }
}

/// Incremental UTF-8 decoder that holds back incomplete trailing sequences.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    if let Some(len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        self.pending.drain(..valid + len);
                    } else {
                        self.pending.drain(..valid);
                        break;
                    }
                }
            }
        }

        out
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
