//! Framing of raw agent output.
//!
//! The agent speaks unframed text. The framer does two things with it:
//! it watches the output for a resumption token (captured once per run), and
//! it routes every chunk verbatim to whichever assistant message is currently
//! bound as the streaming target. Token text stays in the transcript.

use std::sync::LazyLock;

use regex::Regex;

/// Matches `Session ID: <hex/guid>` and the JSON-ish `"session_id": "<id>"`.
static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)session[ _-]?id"?\s*[:=]\s*"?([0-9a-f]+(?:-[0-9a-f]+)*)"#)
        .expect("token pattern is a valid regex")
});

/// Bytes kept behind the scan position so a label split across chunks is
/// still seen whole.
const SCAN_OVERLAP: usize = 128;

/// Content destined for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDelta {
    /// Target message.
    pub message_id: String,
    /// Text to append.
    pub text: String,
}

/// Result of feeding one chunk to the framer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramedChunk {
    /// Resumption token, reported on the chunk that completed it and never again.
    pub token: Option<String>,
    /// The chunk, routed to the bound message. `None` when nothing is bound.
    pub delta: Option<ContentDelta>,
}

/// What remains when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishedRun {
    /// A token that was only complete at end of output.
    pub token: Option<String>,
    /// The message that was still streaming, now ended.
    pub message_id: Option<String>,
}

#[derive(Debug)]
struct Target {
    message_id: String,
    received_output: bool,
}

/// Per-run output framer.
///
/// One framer lives exactly as long as one agent process; a new run gets a
/// fresh framer and therefore a fresh token capture.
#[derive(Debug, Default)]
pub struct OutputFramer {
    /// Unscanned tail of the output, plus the overlap window.
    buffer: String,
    /// Offset in `buffer` where the next scan may start matching.
    scan_from: usize,
    /// An id that reached the end of the output: its match start in `buffer`
    /// and the id as seen so far.
    pending: Option<(usize, String)>,
    token: Option<String>,
    target: Option<Target>,
}

impl OutputFramer {
    /// Create a framer for a new run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `message_id` as the streaming target for subsequent chunks.
    pub fn bind(&mut self, message_id: impl Into<String>) {
        self.target = Some(Target {
            message_id: message_id.into(),
            received_output: false,
        });
    }

    /// Currently bound message, if any.
    pub fn target(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.message_id.as_str())
    }

    /// Whether the bound message has received any output yet.
    pub fn target_has_output(&self) -> bool {
        self.target.as_ref().is_some_and(|t| t.received_output)
    }

    /// Token captured during this run.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Feed one raw chunk.
    pub fn push(&mut self, chunk: &str) -> FramedChunk {
        let token = if self.token.is_none() {
            self.buffer.push_str(chunk);
            self.scan(false)
        } else {
            None
        };

        let delta = self.target.as_mut().map(|target| {
            target.received_output = true;
            ContentDelta {
                message_id: target.message_id.clone(),
                text: chunk.to_string(),
            }
        });

        FramedChunk { token, delta }
    }

    /// End the current reply without ending the run. Returns the unbound message.
    pub fn complete_turn(&mut self) -> Option<String> {
        self.target.take().map(|t| t.message_id)
    }

    /// End the run: flush any trailing token and unbind the streaming message.
    pub fn finish(&mut self) -> FinishedRun {
        let token = if self.token.is_none() {
            self.scan(true)
        } else {
            None
        };
        self.buffer.clear();
        self.scan_from = 0;
        self.pending = None;

        FinishedRun {
            token,
            message_id: self.complete_turn(),
        }
    }

    fn scan(&mut self, at_end: bool) -> Option<String> {
        let start = floor_char_boundary(&self.buffer, self.scan_from.saturating_sub(SCAN_OVERLAP));
        let window = &self.buffer[start..];
        let pending = self.pending.take();

        let mut deferred = None;
        let mut found = None;
        for caps in TOKEN_PATTERN.captures_iter(window) {
            let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let match_start = start + whole.start();
            let rest = &window[id.end()..];

            let accepted = if rest.chars().all(|c| c == '-') {
                // The id reaches the end of the output and may still be growing.
                if at_end {
                    Some(id.as_str().to_string())
                } else {
                    deferred = Some((match_start, id.as_str().to_string()));
                    break;
                }
            } else if rest.starts_with(ends_id) {
                Some(id.as_str().to_string())
            } else {
                // Text glued onto the id: keep what was complete at the chunk
                // edge, otherwise this is prose like "deadline", not an id.
                pending
                    .as_ref()
                    .filter(|(pending_start, _)| *pending_start == match_start)
                    .map(|(_, id)| id.clone())
            };

            if accepted.is_some() {
                found = accepted;
                break;
            }
        }

        if let Some(token) = found {
            self.token = Some(token.clone());
            self.buffer.clear();
            self.scan_from = 0;
            return Some(token);
        }

        self.scan_from = deferred.as_ref().map_or(self.buffer.len(), |(at, _)| *at);

        // Keep only what a later scan could still need.
        let keep_from = floor_char_boundary(&self.buffer, self.scan_from.saturating_sub(SCAN_OVERLAP));
        if keep_from > 0 {
            self.buffer.drain(..keep_from);
            self.scan_from -= keep_from;
        }
        self.pending = deferred.map(|(at, id)| (at - keep_from, id));

        None
    }
}

/// Whether `c` can follow an id without being part of it.
fn ends_id(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_and_content_in_one_chunk() {
        let mut framer = OutputFramer::new();
        framer.bind("m1");

        let out = framer.push("Session ID: abc-123\n");
        assert_eq!(out.token.as_deref(), Some("abc-123"));
        assert_eq!(
            out.delta,
            Some(ContentDelta {
                message_id: "m1".to_string(),
                text: "Session ID: abc-123\n".to_string(),
            })
        );
        assert_eq!(framer.token(), Some("abc-123"));
    }

    #[test]
    fn test_token_split_across_chunks() {
        let mut framer = OutputFramer::new();
        assert_eq!(framer.push("booting...\nSess").token, None);
        assert_eq!(framer.push("ion ID: 4f9a").token, None);
        assert_eq!(framer.push("-77b2").token, None);
        assert_eq!(framer.push("\nready").token.as_deref(), Some("4f9a-77b2"));
    }

    #[test]
    fn test_trailing_dash_defers_capture() {
        let mut framer = OutputFramer::new();
        assert_eq!(framer.push("session_id: abc-").token, None);
        assert_eq!(framer.push("def ").token.as_deref(), Some("abc-def"));
    }

    #[test]
    fn test_hex_prefix_of_a_word_is_not_a_token() {
        let mut framer = OutputFramer::new();
        assert_eq!(framer.push("Session ID: deadline passed\n").token, None);
        assert_eq!(framer.finish().token, None);

        let mut framer = OutputFramer::new();
        let out = framer.push("session id: deadbeefy\nSession ID: c0ffee\n");
        assert_eq!(out.token.as_deref(), Some("c0ffee"));
    }

    #[test]
    fn test_id_at_chunk_edge_is_not_extended_by_prose() {
        let mut framer = OutputFramer::new();
        assert_eq!(framer.push("Session ID: abc-123").token, None);
        let out = framer.push("and now I'll start\n");
        assert_eq!(out.token.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_id_continued_in_next_chunk() {
        let mut framer = OutputFramer::new();
        assert_eq!(framer.push("Session ID: abc-1").token, None);
        assert_eq!(framer.push("23 ready\n").token.as_deref(), Some("abc-123"));
    }

    #[test]
    fn test_first_match_wins_within_a_run() {
        let mut framer = OutputFramer::new();
        framer.bind("m1");
        assert_eq!(framer.push("Session ID: aaa\n").token.as_deref(), Some("aaa"));

        let again = framer.push("Session ID: aaa\nSession ID: bbb\n");
        assert_eq!(again.token, None);
        assert_eq!(framer.token(), Some("aaa"));
        // Content still flows after capture.
        assert!(again.delta.is_some());
    }

    #[test]
    fn test_json_style_label() {
        let mut framer = OutputFramer::new();
        let out = framer.push(r#"{"type":"init","session_id":"0d3c5e2a-1b4f-4c8e-9a7d-2f6b8e1c3a5d"}"#);
        assert_eq!(out.token.as_deref(), Some("0d3c5e2a-1b4f-4c8e-9a7d-2f6b8e1c3a5d"));
    }

    #[test]
    fn test_unbound_chunk_has_no_delta() {
        let mut framer = OutputFramer::new();
        let out = framer.push("hello");
        assert_eq!(out.delta, None);
        assert!(!framer.target_has_output());
    }

    #[test]
    fn test_finish_flushes_token_at_end_of_output() {
        let mut framer = OutputFramer::new();
        framer.bind("m1");
        assert_eq!(framer.push("Session ID: cafe").token, None);

        let finished = framer.finish();
        assert_eq!(finished.token.as_deref(), Some("cafe"));
        assert_eq!(finished.message_id.as_deref(), Some("m1"));
        assert_eq!(framer.target(), None);
    }

    #[test]
    fn test_complete_turn_unbinds() {
        let mut framer = OutputFramer::new();
        framer.bind("m1");
        framer.push("partial answer");
        assert!(framer.target_has_output());

        assert_eq!(framer.complete_turn().as_deref(), Some("m1"));
        assert_eq!(framer.finish().message_id, None);
    }

    #[test]
    fn test_long_output_keeps_buffer_bounded() {
        let mut framer = OutputFramer::new();
        for _ in 0..1000 {
            framer.push("lorem ipsum dolor sit amet, consectetur adipiscing elit\n");
        }
        assert!(framer.buffer.len() <= SCAN_OVERLAP + 64);

        let out = framer.push("Session ID: 1234abcd\n");
        assert_eq!(out.token.as_deref(), Some("1234abcd"));
    }

    #[test]
    fn test_multibyte_text_near_window_edge() {
        let mut framer = OutputFramer::new();
        framer.push(&"é".repeat(200));
        let out = framer.push(" session id = beef\n");
        assert_eq!(out.token.as_deref(), Some("beef"));
    }
}
