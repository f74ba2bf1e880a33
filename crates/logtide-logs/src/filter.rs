use chrono::{DateTime, Utc};
use regex::Regex;

use logtide_types::{LogEntry, LogFilter};

/// Compiled predicates for log entries
///
/// Built once per request from a `LogFilter`; every present predicate must
/// hold for an entry to match.
#[derive(Clone)]
pub struct CompiledFilter {
    /// Case-insensitive literal search (if any)
    search: Option<Regex>,

    /// Original search text
    pattern: String,

    /// Exact level token to keep
    level: Option<String>,

    /// Entries older than this are dropped
    since: Option<DateTime<Utc>>,
}

impl CompiledFilter {
    /// Compile a bounded-query filter, resolving `since` against `now`
    pub fn new(filter: &LogFilter, now: DateTime<Utc>) -> Result<Self, regex::Error> {
        let mut compiled = Self::for_follow(filter)?;
        compiled.since = filter.since.as_ref().and_then(|spec| spec.resolve(now));
        Ok(compiled)
    }

    /// Compile only the predicates that apply to a live tail
    pub fn for_follow(filter: &LogFilter) -> Result<Self, regex::Error> {
        let pattern = filter.search.clone().unwrap_or_default();
        let search = if pattern.is_empty() {
            None
        } else {
            // Escaped so the search text is a plain substring
            Some(Regex::new(&format!("(?i){}", regex::escape(&pattern)))?)
        };

        Ok(Self {
            search,
            pattern,
            level: filter.level.clone(),
            since: None,
        })
    }

    /// Check if a log entry matches this filter
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = &self.level {
            if entry.level.as_str() != level {
                return false;
            }
        }

        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }

        match &self.search {
            Some(re) => re.is_match(&entry.message) || re.is_match(entry.level.as_str()),
            None => true,
        }
    }

    /// Get the original search text
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Resolved lower time bound
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.search.is_none() && self.level.is_none() && self.since.is_none()
    }
}

impl std::fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("pattern", &self.pattern)
            .field("level", &self.level)
            .field("since", &self.since)
            .finish()
    }
}
