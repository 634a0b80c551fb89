//! Prompt Matcher: the streaming-read-until-the-prompt-reappears loop, the
//! async/restartable counterpart of this codebase's blocking
//! `read_until_pattern` poll loop.
//!
//! A Session feeds it chunks read from a `Transport`; it accumulates them
//! into a buffer, strips the first line (the command echo), and reports a
//! match once any pattern in the active pattern set matches the tail of the
//! buffer. NETCONF sessions instead terminate on the literal `]]>]]>`
//! end-of-message marker rather than a regex, per RFC 4742 framing.

use crate::vendor::PromptPattern;
use std::time::{Duration, Instant};

/// How a session decides a response is complete.
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Match against the union of these patterns.
    Patterns(Vec<PromptPattern>),
    /// NETCONF 1.0 chunked framing: wait for the literal marker.
    NetconfEom,
}

const NETCONF_EOM: &str = "]]>]]>";
/// Only the trailing window is checked against patterns; this bounds the
/// cost of re-matching as the buffer grows on a chatty command.
const LOOKBACK_BYTES: usize = 4096;

/// Incrementally accumulates bytes from a transport and reports when the
/// configured terminator has been seen.
pub struct PromptMatcher {
    terminator: Terminator,
    buffer: String,
    echo_stripped: bool,
    /// Byte offset into the *normalized* buffer where the matched prompt
    /// begins, set once `check()` finds a match. `output()` slices up to
    /// this offset so the matched prompt itself is never returned to the
    /// caller.
    matched_start: Option<usize>,
    deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Not yet complete; keep reading.
    Pending,
    /// Complete; caller should stop reading and return `output`.
    Complete,
}

impl PromptMatcher {
    pub fn new(terminator: Terminator, timeout: Duration) -> Self {
        Self {
            terminator,
            buffer: String::new(),
            echo_stripped: false,
            matched_start: None,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Feed a chunk of bytes read from the transport. Invalid UTF-8 is
    /// replaced rather than rejected, mirroring how device output with stray
    /// control bytes is tolerated elsewhere in this codebase's channel layer.
    pub fn feed(&mut self, chunk: &[u8]) -> MatchOutcome {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        // A NETCONF subsystem/exec channel never echoes back what was sent
        // the way an interactive CLI pty does, so there is no echo line to
        // strip — doing so would eat real content off the front of the XML.
        if !matches!(self.terminator, Terminator::NetconfEom) {
            self.strip_echo_if_needed();
        }
        self.check()
    }

    /// The accumulated output, with command echo and the matched prompt
    /// removed — invariant 2 requires that the prompt itself never appears
    /// in a successful result's output.
    pub fn output(&self) -> String {
        match &self.terminator {
            Terminator::NetconfEom => normalize_newlines(
                self.buffer.strip_suffix(NETCONF_EOM).unwrap_or(&self.buffer),
            )
            .trim_end()
            .to_string(),
            Terminator::Patterns(_) => {
                let normalized = normalize_newlines(&self.buffer);
                let end = self.matched_start.unwrap_or(normalized.len());
                normalized[..end].trim_end_matches('\n').to_string()
            }
        }
    }

    fn strip_echo_if_needed(&mut self) {
        if self.echo_stripped {
            return;
        }
        // Only strip once a full line has arrived; a partial first line
        // might still be the start of a prompt match on a terse response.
        if let Some(pos) = self.buffer.find(['\n', '\r']) {
            let rest = &self.buffer[pos..];
            let skip = rest.chars().take_while(|c| *c == '\n' || *c == '\r').count();
            self.buffer = self.buffer[pos + skip..].to_string();
            self.echo_stripped = true;
        }
    }

    fn check(&mut self) -> MatchOutcome {
        match &self.terminator {
            Terminator::NetconfEom => {
                if self.buffer.ends_with(NETCONF_EOM) {
                    MatchOutcome::Complete
                } else {
                    MatchOutcome::Pending
                }
            }
            Terminator::Patterns(patterns) => {
                let normalized = normalize_newlines(&self.buffer);
                let tail_start = normalized.len().saturating_sub(LOOKBACK_BYTES);
                let tail = &normalized[tail_start..];
                match patterns.iter().find_map(|p| p.0.find(tail)) {
                    Some(m) => {
                        self.matched_start = Some(tail_start + m.start());
                        MatchOutcome::Complete
                    }
                    None => MatchOutcome::Pending,
                }
            }
        }
    }
}

/// Normalizes `\r\n` and bare `\r` to `\n` so prompt regexes written against
/// `\n`-delimited text match regardless of the device's line-ending habits.
fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendor::VendorRegistry;

    fn ios_patterns() -> Vec<PromptPattern> {
        VendorRegistry::default_table().unwrap()["cisco_ios"]
            .prompt_regex
            .clone()
    }

    #[test]
    fn matches_prompt_after_echo_and_output() {
        let mut matcher = PromptMatcher::new(
            Terminator::Patterns(ios_patterns()),
            Duration::from_secs(5),
        );
        assert_eq!(
            matcher.feed(b"show version\r\nCisco IOS Software\r\nrouter1#"),
            MatchOutcome::Complete
        );
        // The echoed command ("show version") and the matched prompt
        // ("router1#") are both excluded from output per invariant 2.
        assert_eq!(matcher.output(), "Cisco IOS Software");
    }

    #[test]
    fn pending_until_prompt_arrives_across_chunks() {
        let mut matcher = PromptMatcher::new(
            Terminator::Patterns(ios_patterns()),
            Duration::from_secs(5),
        );
        assert_eq!(matcher.feed(b"show ver"), MatchOutcome::Pending);
        assert_eq!(matcher.feed(b"sion\r\n"), MatchOutcome::Pending);
        assert_eq!(matcher.feed(b"Cisco IOS\r\n"), MatchOutcome::Pending);
        assert_eq!(matcher.feed(b"router1#"), MatchOutcome::Complete);
    }

    #[test]
    fn netconf_terminates_on_eom_marker() {
        let mut matcher = PromptMatcher::new(Terminator::NetconfEom, Duration::from_secs(5));
        assert_eq!(
            matcher.feed(b"<hello/>\n]]>]]>"),
            MatchOutcome::Complete
        );
        assert_eq!(matcher.output(), "<hello/>");
    }

    #[test]
    fn bare_cr_line_endings_are_tolerated() {
        let mut matcher = PromptMatcher::new(
            Terminator::Patterns(ios_patterns()),
            Duration::from_secs(5),
        );
        assert_eq!(
            matcher.feed(b"show clock\rTue Jul 28\rrouter1#"),
            MatchOutcome::Complete
        );
    }

    #[test]
    fn deadline_reports_expired() {
        let matcher = PromptMatcher::new(
            Terminator::Patterns(ios_patterns()),
            Duration::from_millis(0),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(matcher.is_expired());
    }
}
