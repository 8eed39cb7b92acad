//! Tracepoint-level filtering shared by offline and live decoding.
//!
//! A [`TracepointFilter`] with nothing configured accepts everything. Each
//! configured criterion must hold for a tracepoint to pass: timestamp range,
//! pid and tid sets, then message and source file, either as a substring or
//! as a regex searched anywhere in the text.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;

use crate::error::{TraceError, TraceResult};
use crate::tracebuffer::{RawFormatter, Tracepoint};

/// Substring or regex match on a piece of text.
#[derive(Debug, Clone)]
pub enum TextMatch {
    /// Text contains this string.
    Substring(String),
    /// Regex matches somewhere in the text.
    Regex(Regex),
}

impl TextMatch {
    /// Build from a pattern; `regex` selects regex search over substring.
    pub fn new(pattern: &str, regex: bool) -> TraceResult<Self> {
        if !regex {
            return Ok(TextMatch::Substring(pattern.to_string()));
        }
        Regex::new(pattern).map(TextMatch::Regex).map_err(|e| {
            TraceError::Configuration(format!("Invalid regex '{pattern}': {e}"))
        })
    }

    /// Whether `text` matches.
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            TextMatch::Substring(needle) => text.contains(needle.as_str()),
            TextMatch::Regex(regex) => regex.is_match(text),
        }
    }
}

/// Criteria a tracepoint must meet to be shown.
#[derive(Debug, Clone)]
pub struct TracepointFilter {
    time_min: u64,
    time_max: u64,
    pids: HashSet<u32>,
    tids: HashSet<u32>,
    message: Option<TextMatch>,
    file: Option<TextMatch>,
}

impl Default for TracepointFilter {
    fn default() -> Self {
        Self {
            time_min: 0,
            time_max: u64::MAX,
            pids: HashSet::new(),
            tids: HashSet::new(),
            message: None,
            file: None,
        }
    }
}

impl TracepointFilter {
    /// Filter accepting everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep timestamps in `min..=max` nanoseconds.
    pub fn with_time_range(mut self, min: u64, max: u64) -> Self {
        self.time_min = min;
        self.time_max = max;
        self
    }

    /// Keep only these process ids. An empty set keeps all.
    pub fn with_pids(mut self, pids: impl IntoIterator<Item = u32>) -> Self {
        self.pids = pids.into_iter().collect();
        self
    }

    /// Keep only these thread ids. An empty set keeps all.
    pub fn with_tids(mut self, tids: impl IntoIterator<Item = u32>) -> Self {
        self.tids = tids.into_iter().collect();
        self
    }

    /// Keep tracepoints whose rendered message matches. An empty pattern is
    /// ignored.
    pub fn with_message(mut self, pattern: &str, regex: bool) -> TraceResult<Self> {
        if !pattern.is_empty() {
            self.message = Some(TextMatch::new(pattern, regex)?);
        }
        Ok(self)
    }

    /// Keep tracepoints whose source file matches. An empty pattern is
    /// ignored.
    pub fn with_file(mut self, pattern: &str, regex: bool) -> TraceResult<Self> {
        if !pattern.is_empty() {
            self.file = Some(TextMatch::new(pattern, regex)?);
        }
        Ok(self)
    }

    /// Any criterion is configured.
    pub fn is_active(&self) -> bool {
        self.time_min > 0
            || self.time_max < u64::MAX
            || !self.pids.is_empty()
            || !self.tids.is_empty()
            || self.message.is_some()
            || self.file.is_some()
    }

    /// Whether `tracepoint` passes every configured criterion.
    pub fn matches(&self, tracepoint: &Tracepoint) -> bool {
        if tracepoint.timestamp_ns < self.time_min || tracepoint.timestamp_ns > self.time_max {
            return false;
        }
        if !self.pids.is_empty() && !self.pids.contains(&tracepoint.pid) {
            return false;
        }
        if !self.tids.is_empty() && !self.tids.contains(&tracepoint.tid) {
            return false;
        }
        if let Some(message) = &self.message {
            if !message.is_match(&tracepoint.message(&RawFormatter)) {
                return false;
            }
        }
        if let Some(file) = &self.file {
            if !file.is_match(tracepoint.file()) {
                return false;
            }
        }
        true
    }
}

/// Parse a point in time into nanoseconds since the Unix epoch.
///
/// Accepts Unix seconds with an optional fraction (`1700000000.25`), an
/// RFC 3339 timestamp, or an ISO 8601 date and time without offset, taken
/// as UTC (`2025-11-25T21:46:29`).
pub fn parse_time(text: &str) -> TraceResult<u64> {
    let text = text.trim();
    if let Some(ns) = parse_unix_seconds(text) {
        return Ok(ns);
    }
    let datetime = DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|_| TraceError::Configuration(format!("Invalid time '{text}'")))?;
    datetime
        .and_utc()
        .timestamp_nanos_opt()
        .and_then(|ns| u64::try_from(ns).ok())
        .ok_or_else(|| TraceError::Configuration(format!("Time out of range '{text}'")))
}

fn parse_unix_seconds(text: &str) -> Option<u64> {
    let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: u64 = secs.parse().ok()?;
    let nanos: u64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<9}").parse().ok()?
    };
    secs.checked_mul(1_000_000_000)?.checked_add(nanos)
}
