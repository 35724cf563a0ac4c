//! Pre-handshake output capture
//!
//! A freshly spawned server either speaks JSON-RPC or prints something a human
//! should read (a usage line, a missing variable, an npm 404). `EarlyOutput`
//! keeps that text until the first valid protocol message arrives, then seals
//! itself so payload bytes are never mistaken for a startup failure.

use crate::sync::MutexExt;
use std::sync::{Arc, Mutex};

/// Maximum number of bytes retained
const MAX_CAPTURE_BYTES: usize = 16 * 1024;

#[derive(Debug, Default)]
struct CaptureState {
    text: String,
    truncated: bool,
    protocol_seen: bool,
}

/// Point-in-time copy of the captured output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Captured lines, newline separated
    pub text: String,
    /// Whether older output was dropped to respect the size limit
    pub truncated: bool,
    /// Whether valid protocol traffic was observed
    pub protocol_seen: bool,
}

impl CapturedOutput {
    /// Last `max_lines` non-empty lines, for error evidence
    pub fn tail(&self, max_lines: usize) -> Option<String> {
        let lines: Vec<&str> = self
            .text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        if lines.is_empty() {
            return None;
        }
        let start = lines.len().saturating_sub(max_lines);
        Some(lines[start..].join("\n"))
    }
}

/// Shared buffer for a server's pre-handshake stdout and stderr
#[derive(Debug, Clone, Default)]
pub struct EarlyOutput {
    state: Arc<Mutex<CaptureState>>,
}

impl EarlyOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line unless protocol traffic was already seen
    pub fn record_line(&self, line: &str) {
        let mut state = self.state.lock_unpoisoned();
        if state.protocol_seen {
            return;
        }

        state.text.push_str(line);
        state.text.push('\n');

        if state.text.len() > MAX_CAPTURE_BYTES {
            // Keep the tail: the last lines usually carry the fatal message
            let mut cut = state.text.len() - MAX_CAPTURE_BYTES;
            while !state.text.is_char_boundary(cut) {
                cut += 1;
            }
            state.text.drain(..cut);
            state.truncated = true;
        }
    }

    /// Mark that valid protocol traffic was observed; later lines are ignored
    pub fn seal(&self) {
        self.state.lock_unpoisoned().protocol_seen = true;
    }

    pub fn protocol_seen(&self) -> bool {
        self.state.lock_unpoisoned().protocol_seen
    }

    pub fn snapshot(&self) -> CapturedOutput {
        let state = self.state.lock_unpoisoned();
        CapturedOutput {
            text: state.text.clone(),
            truncated: state.truncated,
            protocol_seen: state.protocol_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_recorded_until_sealed() {
        let output = EarlyOutput::new();
        output.record_line("Usage: server <dir>");
        output.seal();
        output.record_line("{\"jsonrpc\":\"2.0\"} trailing noise");

        let snapshot = output.snapshot();
        assert_eq!(snapshot.text, "Usage: server <dir>\n");
        assert!(snapshot.protocol_seen);
    }

    #[test]
    fn test_capture_is_bounded_and_keeps_tail() {
        let output = EarlyOutput::new();
        let filler = "x".repeat(1024);
        for _ in 0..32 {
            output.record_line(&filler);
        }
        output.record_line("Error: FINAL line");

        let snapshot = output.snapshot();
        assert!(snapshot.text.len() <= MAX_CAPTURE_BYTES);
        assert!(snapshot.truncated);
        assert!(snapshot.text.ends_with("Error: FINAL line\n"));
    }

    #[test]
    fn test_tail_skips_blank_lines() {
        let output = EarlyOutput::new();
        for line in ["one", "", "two", "three"] {
            output.record_line(line);
        }

        let snapshot = output.snapshot();
        assert_eq!(snapshot.tail(2).as_deref(), Some("two\nthree"));
        assert_eq!(EarlyOutput::new().snapshot().tail(3), None);
    }
}
