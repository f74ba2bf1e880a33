use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use logtide_types::{LogEntry, LogLevel};

/// Header line: `YYYY/MM/DD HH:MM:SS [ctx] [LEVEL] text`
static HEADER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}) \[.*?\] \[([A-Z]+)\] (.*)$")
        .expect("header pattern is valid")
});

const HEADER_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// What to do with a continuation line when no record is open
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Open a new INFO record holding the line (bounded queries)
    Standalone,
    /// Drop the line (live follow)
    Discard,
}

/// Source of the fallback timestamp for records without a usable one
#[derive(Clone, Copy, Debug)]
pub enum Clock {
    System,
    /// One instant for the whole invocation, so repeated runs agree
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Fixed(ts) => *ts,
        }
    }
}

/// Stateful parser that turns raw lines into complete log records
///
/// A header line closes the open record (returning it) and opens a new one;
/// any other line is appended to the open record's message.
#[derive(Debug)]
pub struct LineAssembler {
    pending: Option<LogEntry>,

    /// Header of the record handed out by `release`, until the next header
    released: Option<(DateTime<Utc>, LogLevel)>,

    orphans: OrphanPolicy,
    clock: Clock,
}

impl LineAssembler {
    pub fn new(orphans: OrphanPolicy) -> Self {
        Self {
            pending: None,
            released: None,
            orphans,
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Feed one raw line; returns the record it closed, if any
    pub fn push_line(&mut self, raw: &str) -> Option<LogEntry> {
        let line = raw.trim_end();
        if line.trim_start().is_empty() {
            return None;
        }

        if let Some(header) = parse_header(line.trim_start(), self.clock) {
            self.released = None;
            return self.pending.replace(header);
        }

        if let Some(entry) = self.pending.as_mut() {
            entry.append_line(line);
            return None;
        }

        if let Some((timestamp, level)) = &self.released {
            self.pending = Some(LogEntry::new(*timestamp, level.clone(), line));
            return None;
        }

        match self.orphans {
            OrphanPolicy::Standalone => {
                self.pending = Some(LogEntry::new(
                    self.clock.now(),
                    LogLevel::Info,
                    line.trim_start(),
                ));
            }
            OrphanPolicy::Discard => {
                debug!("dropping continuation line with no open record");
            }
        }
        None
    }

    /// Close and return the open record
    pub fn finish(&mut self) -> Option<LogEntry> {
        self.pending.take()
    }

    /// Hand out the open record before its end is known
    ///
    /// Continuation lines that arrive afterwards open a follow-on record
    /// with the released record's timestamp and level, until the next
    /// header. They are never treated as orphans.
    pub fn release(&mut self) -> Option<LogEntry> {
        let entry = self.pending.take()?;
        self.released = Some((entry.timestamp, entry.level.clone()));
        Some(entry)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Assemble a whole block of raw text
pub fn assemble(text: &str, orphans: OrphanPolicy, clock: Clock) -> Vec<LogEntry> {
    let mut assembler = LineAssembler::new(orphans).with_clock(clock);
    let mut entries: Vec<LogEntry> = text
        .lines()
        .filter_map(|line| assembler.push_line(line))
        .collect();
    entries.extend(assembler.finish());
    entries
}

/// Parse a header line into a fresh record
///
/// A timestamp that matches the pattern but is not a real date falls back to
/// the clock; the line is still a header.
pub fn parse_header(line: &str, clock: Clock) -> Option<LogEntry> {
    let caps = HEADER_PATTERN.captures(line)?;
    let raw_ts = &caps[1];

    let timestamp = match NaiveDateTime::parse_from_str(raw_ts, HEADER_TIME_FORMAT) {
        Ok(naive) => naive.and_utc(),
        Err(e) => {
            warn!(timestamp = raw_ts, error = %e, "unparseable header timestamp, using now");
            clock.now()
        }
    };

    Some(LogEntry::new(timestamp, LogLevel::parse(&caps[2]), &caps[3]))
}

/// Check if a line opens a new record
pub fn is_header(line: &str) -> bool {
    HEADER_PATTERN.is_match(line.trim())
}
