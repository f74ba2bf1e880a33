//! Shared types for logtide
//!
//! This crate contains data structures used across multiple logtide crates:
//! the log record and its filter, the metrics snapshot, and the envelope that
//! carries either one through the hub.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
///
/// Tokens outside the known set are kept verbatim in `Other`, so filtering on
/// level is always a literal comparison against `as_str()`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Other(String),
}

impl LogLevel {
    /// Parse a level token exactly as it appeared in the header line
    pub fn parse(token: &str) -> Self {
        match token {
            "DEBUG" => Self::Debug,
            "INFO" => Self::Info,
            "WARN" => Self::Warn,
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Other(token) => token,
        }
    }

    /// Whether this level came from outside the known set
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for LogLevel {
    fn from(token: String) -> Self {
        Self::parse(&token)
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Other(token) => token,
            known => known.as_str().to_string(),
        }
    }
}

/// A single assembled log record
///
/// `message` may span several lines when continuation lines were merged into
/// the record that opened them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
        }
    }

    /// Append a continuation line, separated by a literal newline
    pub fn append_line(&mut self, line: &str) {
        self.message.push('\n');
        self.message.push_str(line);
    }
}

/// Unit of a relative `since` spec
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinceUnit {
    Minutes,
    Hours,
    Days,
}

/// Lower time bound for a bounded query
///
/// Relative specs (`5m`, `1h`, `2d`, optionally suffixed with `ago`) are
/// normalized for the log source; anything else passes through untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SinceSpec {
    Relative { amount: u32, unit: SinceUnit },
    Absolute(String),
}

impl SinceSpec {
    /// Parse a spec; blank input means "no bound"
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        let body = strip_ago(trimmed);
        if let Some(relative) = Self::parse_relative(body) {
            return Some(relative);
        }

        Some(Self::Absolute(trimmed.to_string()))
    }

    fn parse_relative(body: &str) -> Option<Self> {
        let unit = match body.chars().last()? {
            'm' => SinceUnit::Minutes,
            'h' => SinceUnit::Hours,
            'd' => SinceUnit::Days,
            _ => return None,
        };
        let digits = body[..body.len() - 1].trim_end();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let amount = digits.parse().ok()?;
        Some(Self::Relative { amount, unit })
    }

    /// Length of a relative spec
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Relative { amount, unit } => {
                let amount = i64::from(*amount);
                match unit {
                    SinceUnit::Minutes => Duration::try_minutes(amount),
                    SinceUnit::Hours => Duration::try_hours(amount),
                    SinceUnit::Days => Duration::try_days(amount),
                }
            }
            Self::Absolute(_) => None,
        }
    }

    /// Render in journalctl `--since` syntax
    pub fn to_source_syntax(&self) -> String {
        match self {
            Self::Relative { amount, unit } => {
                let suffix = match unit {
                    SinceUnit::Minutes => "min",
                    SinceUnit::Hours => "h",
                    SinceUnit::Days => "d",
                };
                format!("{amount}{suffix} ago")
            }
            Self::Absolute(raw) => raw.clone(),
        }
    }

    /// Resolve to an instant, if the spec can be understood locally
    ///
    /// Absolute specs the source understands but we do not (`yesterday`,
    /// `today`, ...) resolve to `None` and are left to the source.
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Relative { .. } => self.duration().and_then(|d| now.checked_sub_signed(d)),
            Self::Absolute(raw) => parse_absolute(raw),
        }
    }
}

impl fmt::Display for SinceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relative { amount, unit } => {
                let suffix = match unit {
                    SinceUnit::Minutes => 'm',
                    SinceUnit::Hours => 'h',
                    SinceUnit::Days => 'd',
                };
                write!(f, "{amount}{suffix}")
            }
            Self::Absolute(raw) => f.write_str(raw),
        }
    }
}

impl TryFrom<String> for SinceSpec {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| "empty since spec".to_string())
    }
}

impl From<SinceSpec> for String {
    fn from(spec: SinceSpec) -> Self {
        spec.to_string()
    }
}

fn strip_ago(s: &str) -> &str {
    let lower = s.to_ascii_lowercase();
    if lower.ends_with("ago") && s.len() > 3 {
        s[..s.len() - 3].trim_end()
    } else {
        s
    }
}

fn parse_absolute(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Filter for a log query or live tail
///
/// Present predicates combine as a conjunction. `max_lines` and `since` only
/// apply to bounded queries; a live tail only looks at `level` and `search`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<NonZeroUsize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<SinceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap on raw lines; zero clears the cap
    pub fn with_max_lines(mut self, lines: usize) -> Self {
        self.max_lines = NonZeroUsize::new(lines);
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = non_blank(level);
        self
    }

    pub fn with_since(mut self, since: &str) -> Self {
        self.since = SinceSpec::parse(since);
        self
    }

    pub fn with_search(mut self, search: &str) -> Self {
        self.search = non_blank(search);
        self
    }

    /// The subset of this filter that makes sense for a live tail
    pub fn for_follow(&self) -> Self {
        Self {
            max_lines: None,
            since: None,
            level: self.level.clone(),
            search: self.search.clone(),
        }
    }

    /// Check if the filter has no predicates
    pub fn is_empty(&self) -> bool {
        self.max_lines.is_none()
            && self.level.is_none()
            && self.since.is_none()
            && self.search.is_none()
    }
}

fn non_blank(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Result of a bounded log query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogQueryResult {
    pub entries: Vec<LogEntry>,
    pub total: usize,
    pub unit: String,
}

impl LogQueryResult {
    pub fn new(unit: impl Into<String>, entries: Vec<LogEntry>) -> Self {
        Self {
            total: entries.len(),
            entries,
            unit: unit.into(),
        }
    }
}

// ============================================================================
// Metrics Types
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cores: usize,
    /// 1, 5 and 15 minute load averages
    pub load_average: [f64; 3],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

impl MemoryInfo {
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        let used_bytes = total_bytes.saturating_sub(available_bytes);
        let used_percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };
        Self {
            total_bytes,
            used_bytes,
            available_bytes,
            used_percent,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UptimeInfo {
    pub uptime_seconds: u64,
    pub boot_time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub os: String,
    pub arch: String,
}

impl RuntimeInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Point-in-time host health sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub uptime: UptimeInfo,
    pub runtime: RuntimeInfo,
}

// ============================================================================
// Envelope
// ============================================================================

/// Unit of data carried through the hub
///
/// The hub never looks inside; it only forwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Envelope {
    Metrics(MetricsSnapshot),
    Log(LogEntry),
}

impl From<MetricsSnapshot> for Envelope {
    fn from(snapshot: MetricsSnapshot) -> Self {
        Self::Metrics(snapshot)
    }
}

impl From<LogEntry> for Envelope {
    fn from(entry: LogEntry) -> Self {
        Self::Log(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_level_known_tokens() {
        assert_eq!(LogLevel::parse("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warn);
        assert!(LogLevel::parse("FATAL").is_known());
    }

    #[test]
    fn test_level_unknown_token_kept_verbatim() {
        let level = LogLevel::parse("TRACE");
        assert_eq!(level, LogLevel::Other("TRACE".to_string()));
        assert_eq!(level.as_str(), "TRACE");

        // No alias folding: WARNING is not WARN
        assert_eq!(LogLevel::parse("WARNING").as_str(), "WARNING");
        assert!(!LogLevel::parse("WARNING").is_known());
    }

    #[test]
    fn test_entry_wire_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let entry = LogEntry::new(ts, LogLevel::parse("NOTICE"), "hello\nworld");
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["timestamp"], "2024-01-01T10:00:00Z");
        assert_eq!(json["level"], "NOTICE");
        assert_eq!(json["message"], "hello\nworld");

        let back: LogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_since_relative_forms() {
        assert_eq!(
            SinceSpec::parse("5m"),
            Some(SinceSpec::Relative {
                amount: 5,
                unit: SinceUnit::Minutes
            })
        );
        assert_eq!(
            SinceSpec::parse("1h ago"),
            Some(SinceSpec::Relative {
                amount: 1,
                unit: SinceUnit::Hours
            })
        );
        assert_eq!(SinceSpec::parse("  "), None);
    }

    #[test]
    fn test_since_source_syntax() {
        assert_eq!(SinceSpec::parse("5m").unwrap().to_source_syntax(), "5min ago");
        assert_eq!(SinceSpec::parse("1d").unwrap().to_source_syntax(), "1d ago");
        assert_eq!(
            SinceSpec::parse("2024-01-01 00:00:00").unwrap().to_source_syntax(),
            "2024-01-01 00:00:00"
        );
        assert_eq!(SinceSpec::parse("yesterday").unwrap().to_source_syntax(), "yesterday");
    }

    #[test]
    fn test_since_resolve() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();

        let bound = SinceSpec::parse("1h").unwrap().resolve(now).unwrap();
        assert_eq!(bound, Utc.with_ymd_and_hms(2024, 1, 2, 11, 0, 0).unwrap());

        let bound = SinceSpec::parse("2024-01-01").unwrap().resolve(now).unwrap();
        assert_eq!(bound, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        assert!(SinceSpec::parse("yesterday").unwrap().resolve(now).is_none());
    }

    #[test]
    fn test_filter_builders_ignore_blank() {
        let filter = LogFilter::new()
            .with_max_lines(0)
            .with_level("")
            .with_since(" ")
            .with_search("");
        assert!(filter.is_empty());

        let filter = LogFilter::new().with_max_lines(50).with_since("1h").with_level("INFO");
        let follow = filter.for_follow();
        assert!(follow.max_lines.is_none());
        assert!(follow.since.is_none());
        assert_eq!(follow.level.as_deref(), Some("INFO"));
    }

    #[test]
    fn test_envelope_is_tagged() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let envelope = Envelope::from(LogEntry::new(ts, LogLevel::Info, "ok"));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["data"]["message"], "ok");
    }

    #[test]
    fn test_memory_used_percent() {
        let mem = MemoryInfo::new(1000, 250);
        assert_eq!(mem.used_bytes, 750);
        assert!((mem.used_percent - 75.0).abs() < f64::EPSILON);
        assert_eq!(MemoryInfo::new(0, 0).used_percent, 0.0);
    }
}
