//! FFmpeg diagnostics parsing.
//!
//! The transcoder reports everything on stderr as loosely structured text.
//! [`DiagnosticsParser`] buffers arbitrary chunks, splits them into lines
//! (`\n` or `\r`, since progress lines are rewritten in place), and turns each
//! line into zero or more [`DiagnosticEvent`]s.
//!
//! Per-line precedence: segment open, then progress (and the one-time
//! `Connected`), then end-of-input markers, then error categories. Lines that
//! match none of these are reported as `Unclassified`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::utils::redact::Redactor;

/// Default number of diagnostic lines kept for exit classification.
pub const DEFAULT_TAIL_CAPACITY: usize = 20;

static SEGMENT_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)opening\s+['"][^'"]*?segment_(\d+)\.[a-z0-9]+['"]\s+for\s+(writing|reading)"#)
        .expect("segment pattern is valid")
});

static PROGRESS_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)(?:frame|fps|time)=").expect("progress pattern is valid"));

static TIME_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(-?\d+:\d{2}:\d{2}(?:\.\d+)?)").expect("time pattern is valid")
});

static END_OF_INPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)end of file|immediate exit requested|range not satisfiable|server returned 416")
        .expect("eof pattern is valid")
});

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)error|failed|refused|unreachable|invalid|could not|cannot|unable|timed out|denied|forbidden|not found|no such file",
    )
    .expect("error pattern is valid")
});

static NETWORK_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)connection refused|network is unreachable|no route to host|timed out|connection reset|broken pipe|failed to resolve|name or service not known|temporary failure in name resolution|server returned 5\d\d",
    )
    .expect("network pattern is valid")
});

static CONFIG_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)invalid argument|no such file or directory|unrecognized option|option \S+ not found|unknown (?:encoder|decoder)|invalid data found|server returned 40[0-4]|permission denied|does not contain any stream",
    )
    .expect("config pattern is valid")
});

static PROTOCOL_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)rtmp|handshake|protocol not found|input/output error|error writing trailer|av_interleaved_write_frame|non-monoton",
    )
    .expect("protocol pattern is valid")
});

/// Coarse category of an error line. Used for logging and status only;
/// restart decisions are driven by exit codes and end-of-input markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NetworkUnreachable,
    ConfigInvalid,
    ProtocolError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkUnreachable => "network_unreachable",
            Self::ConfigInvalid => "config_invalid",
            Self::ProtocolError => "protocol_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event derived from one diagnostics line.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    /// First progress marker since the process started.
    Connected,
    /// Output position in seconds, relative to the process start.
    Progress(f64),
    /// The capture process opened `segment_<id>` for writing.
    SegmentReady(u64),
    /// A publish process opened `segment_<id>` for reading.
    SegmentConsumed(u64),
    /// An explicit end-of-stream marker.
    EndOfInput,
    /// An error line, redacted.
    ErrorDetected {
        category: ErrorCategory,
        message: String,
    },
    /// Anything else, redacted.
    Unclassified(String),
}

/// Parse time string in HH:MM:SS.ms format to seconds.
///
/// # Examples
/// ```ignore
/// assert_eq!(parse_time("00:00:10.50"), Some(10.5));
/// assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
/// assert_eq!(parse_time("invalid"), None);
/// ```
pub fn parse_time(time_str: &str) -> Option<f64> {
    let (negative, time_str) = match time_str.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, time_str),
    };

    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    Some(if negative { -total } else { total })
}

/// Parse the `time=` field of a progress line. `time=N/A` yields `None`.
pub fn parse_time_field(line: &str) -> Option<f64> {
    let caps = TIME_FIELD.captures(line)?;
    parse_time(caps.get(1)?.as_str()).map(|t| t.max(0.0))
}

/// Whether a line carries one of the progress-rate markers.
pub fn is_progress_line(line: &str) -> bool {
    PROGRESS_MARKER.is_match(line)
}

/// Whether a line carries an explicit end-of-stream marker.
pub fn is_end_of_input(line: &str) -> bool {
    END_OF_INPUT.is_match(line)
}

/// Categorize an error line. Returns `None` for lines that are not errors.
pub fn classify_error(line: &str) -> Option<ErrorCategory> {
    if !ERROR_LINE.is_match(line) {
        return None;
    }

    let category = if NETWORK_ERROR.is_match(line) {
        ErrorCategory::NetworkUnreachable
    } else if CONFIG_ERROR.is_match(line) {
        ErrorCategory::ConfigInvalid
    } else if PROTOCOL_ERROR.is_match(line) {
        ErrorCategory::ProtocolError
    } else {
        ErrorCategory::Unknown
    };
    Some(category)
}

/// Parse an "Opening '...segment_N.ext' for writing|reading" message.
///
/// Returns the segment id and whether the file was opened for writing.
pub fn parse_segment_open(line: &str) -> Option<(u64, bool)> {
    let caps = SEGMENT_OPEN.captures(line)?;
    let id = caps.get(1)?.as_str().parse().ok()?;
    let writing = caps.get(2)?.as_str().eq_ignore_ascii_case("writing");
    Some((id, writing))
}

/// Incremental, chunk-boundary-agnostic diagnostics parser for one process instance.
#[derive(Debug)]
pub struct DiagnosticsParser {
    pending: String,
    connected: bool,
    tail: VecDeque<String>,
    tail_capacity: usize,
    last_line: Option<String>,
    redactor: Redactor,
}

impl DiagnosticsParser {
    pub fn new(redactor: Redactor) -> Self {
        Self::with_tail_capacity(redactor, DEFAULT_TAIL_CAPACITY)
    }

    pub fn with_tail_capacity(redactor: Redactor, tail_capacity: usize) -> Self {
        Self {
            pending: String::new(),
            connected: false,
            tail: VecDeque::with_capacity(tail_capacity),
            tail_capacity: tail_capacity.max(1),
            last_line: None,
            redactor,
        }
    }

    /// Feed a chunk of text. Complete lines are parsed; a trailing partial
    /// line is kept until the next chunk (or [`finish`](Self::finish)).
    pub fn feed(&mut self, chunk: &str) -> Vec<DiagnosticEvent> {
        self.pending.push_str(chunk);

        let mut events = Vec::new();
        while let Some(idx) = self.pending.find(['\n', '\r']) {
            let line: String = self.pending.drain(..=idx).collect();
            self.parse_line(line.trim(), &mut events);
        }
        events
    }

    /// Flush whatever partial line is left. Call once the output stream closes.
    pub fn finish(&mut self) -> Vec<DiagnosticEvent> {
        let rest = std::mem::take(&mut self.pending);
        let mut events = Vec::new();
        self.parse_line(rest.trim(), &mut events);
        events
    }

    /// The most recent non-progress lines (redacted), oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    /// The most recent line of any kind (redacted).
    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    /// Whether a progress marker has been seen since the last reset.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Forget everything. Called before a new process instance starts.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.connected = false;
        self.tail.clear();
        self.last_line = None;
    }

    fn parse_line(&mut self, line: &str, events: &mut Vec<DiagnosticEvent>) {
        if line.is_empty() {
            return;
        }

        let redacted = self.redactor.redact(line).into_owned();
        self.last_line = Some(redacted.clone());

        if let Some((id, writing)) = parse_segment_open(line) {
            events.push(if writing {
                DiagnosticEvent::SegmentReady(id)
            } else {
                DiagnosticEvent::SegmentConsumed(id)
            });
            self.push_tail(redacted);
            return;
        }

        if is_progress_line(line) {
            if !self.connected {
                self.connected = true;
                events.push(DiagnosticEvent::Connected);
            }
            if let Some(position) = parse_time_field(line) {
                events.push(DiagnosticEvent::Progress(position));
            }
            return;
        }

        if is_end_of_input(line) {
            events.push(DiagnosticEvent::EndOfInput);
        } else if let Some(category) = classify_error(line) {
            events.push(DiagnosticEvent::ErrorDetected {
                category,
                message: redacted.clone(),
            });
        } else {
            events.push(DiagnosticEvent::Unclassified(redacted.clone()));
        }
        self.push_tail(redacted);
    }

    fn push_tail(&mut self, line: String) {
        if self.tail.len() == self.tail_capacity {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> DiagnosticsParser {
        DiagnosticsParser::new(Redactor::from_urls(["rtmp://a.rtmp.youtube.com/live2/KEY-1"]))
    }

    #[test]
    fn test_parse_time_valid() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("00:01:30.50"), Some(90.5));
        assert_eq!(parse_time("-00:00:00.02"), Some(-0.02));
    }

    #[test]
    fn test_parse_time_invalid() {
        assert_eq!(parse_time("invalid"), None);
        assert_eq!(parse_time("00:00"), None);
        assert_eq!(parse_time(""), None);
        assert_eq!(parse_time("00:00:00:00"), None);
    }

    #[test]
    fn test_parse_time_field() {
        let line = "frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x";
        assert_eq!(parse_time_field(line), Some(4.0));
        assert_eq!(parse_time_field("frame=1 time=N/A bitrate=N/A"), None);
        assert_eq!(parse_time_field("size=0kB time=-00:00:00.04"), Some(0.0));
    }

    #[test]
    fn test_segment_open() {
        assert_eq!(
            parse_segment_open("[hls @ 0x55d] Opening 'cache/segment_42.ts' for writing"),
            Some((42, true))
        );
        assert_eq!(
            parse_segment_open("[hls @ 0x7f] Opening '/srv/segment_dir/segment_7.ts' for reading"),
            Some((7, false))
        );
        assert_eq!(parse_segment_open("Opening 'output_001.ts' for writing"), None);
        assert_eq!(parse_segment_open("frame=100 fps=25"), None);
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(
            classify_error("[tcp @ 0x1] Connection to tcp://a.rtmp.youtube.com:1935 failed: Connection refused"),
            Some(ErrorCategory::NetworkUnreachable)
        );
        assert_eq!(
            classify_error("https://dl.example.com/x.mp4: No such file or directory"),
            Some(ErrorCategory::ConfigInvalid)
        );
        assert_eq!(
            classify_error("[rtmp @ 0x2] Server error: Already publishing"),
            Some(ErrorCategory::ProtocolError)
        );
        assert_eq!(
            classify_error("Something mysterious failed"),
            Some(ErrorCategory::Unknown)
        );
        assert_eq!(classify_error("Stream #0:0: Video: h264"), None);
    }

    #[test]
    fn test_connected_once_then_progress() {
        let mut p = parser();
        let events = p.feed("frame=   1 fps=0.0 q=0.0 size=0kB time=00:00:00.50 bitrate=N/A\n");
        assert_eq!(
            events,
            vec![DiagnosticEvent::Connected, DiagnosticEvent::Progress(0.5)]
        );

        let events = p.feed("frame=  50 fps=25 q=28.0 size=512kB time=00:00:02.00 bitrate=2097.2kbits/s\r");
        assert_eq!(events, vec![DiagnosticEvent::Progress(2.0)]);
        assert!(p.is_connected());
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut p = parser();
        assert!(p.feed("[hls @ 0x1] Opening 'cache/seg").is_empty());
        assert!(p.feed("ment_3.ts' for wri").is_empty());
        assert_eq!(
            p.feed("ting\nframe=10 time=00:00:0"),
            vec![DiagnosticEvent::SegmentReady(3)]
        );
        assert_eq!(
            p.feed("1.00 speed=1x\r"),
            vec![DiagnosticEvent::Connected, DiagnosticEvent::Progress(1.0)]
        );
    }

    #[test]
    fn test_segment_open_is_not_preempted_by_progress() {
        let mut p = parser();
        let events = p.feed("frame=10 [hls @ 0x1] Opening 'segment_9.ts' for writing\n");
        assert_eq!(events, vec![DiagnosticEvent::SegmentReady(9)]);
        assert!(!p.is_connected());
    }

    #[test]
    fn test_end_of_input_and_tail() {
        let mut p = parser();
        p.feed("[https @ 0x1] Stream ends prematurely\n");
        p.feed("frame=100 time=00:00:04.00\n");
        let events = p.feed("[in#0/mov @ 0x2] Error during demuxing: End of file\n");
        assert_eq!(events, vec![DiagnosticEvent::EndOfInput]);

        let tail = p.tail();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].contains("End of file"));
    }

    #[test]
    fn test_tail_is_bounded_and_redacted() {
        let mut p = DiagnosticsParser::with_tail_capacity(
            Redactor::from_urls(["rtmp://a.rtmp.youtube.com/live2/KEY-1"]),
            3,
        );
        for i in 0..5 {
            p.feed(&format!("line {i}\n"));
        }
        p.feed("[rtmp @ 0x1] Cannot open connection rtmp://a.rtmp.youtube.com/live2/KEY-1\n");

        let tail = p.tail();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0], "line 3");
        assert!(tail.iter().all(|l| !l.contains("KEY-1")));
        assert!(p.last_line().unwrap().contains("<redacted>"));
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut p = parser();
        assert!(p.feed("Exiting normally, received signal 15.").is_empty());
        let events = p.finish();
        assert_eq!(
            events,
            vec![DiagnosticEvent::Unclassified(
                "Exiting normally, received signal 15.".to_string()
            )]
        );
        assert!(p.finish().is_empty());
    }

    #[test]
    fn test_reset_clears_connection() {
        let mut p = parser();
        p.feed("frame=1 time=00:00:01.00\n");
        p.reset();
        assert!(!p.is_connected());
        assert!(p.tail().is_empty());
        assert_eq!(
            p.feed("frame=1 time=00:00:01.00\n")[0],
            DiagnosticEvent::Connected
        );
    }
}
