use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logtide_types::{LogEntry, LogFilter, LogLevel, LogQueryResult};

use crate::assembler::{Clock, LineAssembler, OrphanPolicy};
use crate::error::{LogError, Result};
use crate::filter::CompiledFilter;
use crate::merge::TickMerger;
use crate::process::{self, FollowProcess, LineSplitter};
use crate::source::LogSource;

/// Floor for the follow loop's quiet period
const MIN_IDLE_FLUSH: Duration = Duration::from_millis(10);

/// Adapter timing and buffer sizes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Hard limit for a bounded query
    pub fetch_timeout: Duration,
    /// Hard limit for listing units
    pub units_timeout: Duration,
    /// Bytes requested per read of the follow pipe
    pub read_chunk_size: usize,
    /// Quiet period after which a live tail releases its open record
    pub idle_flush: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            units_timeout: Duration::from_secs(5),
            read_chunk_size: 4096,
            idle_flush: Duration::from_millis(250),
        }
    }
}

/// How a follow ended without error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowEnd {
    /// The caller's cancellation fired
    Cancelled,
    /// The source exited cleanly
    Ended,
}

/// Bounded queries and live follows over a `LogSource`
#[derive(Clone, Debug)]
pub struct LogAdapter {
    source: Arc<dyn LogSource>,
    config: AdapterConfig,
}

impl LogAdapter {
    pub fn new(source: Arc<dyn LogSource>, config: AdapterConfig) -> Self {
        Self { source, config }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Fetch a filtered, time-ordered slice of historical records
    pub async fn fetch(
        &self,
        unit: &str,
        filter: &LogFilter,
        cancel: &CancellationToken,
    ) -> Result<LogQueryResult> {
        validate_unit(unit)?;
        let now = Utc::now();
        let compiled = CompiledFilter::new(filter, now)?;

        let command = self
            .source
            .query_command(unit, filter.max_lines, filter.since.as_ref());
        debug!(unit, source = self.source.name(), command = %command, "fetching logs");

        let raw = process::run_bounded(&command, self.config.fetch_timeout, cancel).await?;
        let entries = assemble_query(&raw, filter.max_lines, &compiled, now);

        debug!(unit, total = entries.len(), "fetch complete");
        Ok(LogQueryResult::new(unit, entries))
    }

    /// Stream newly appended records to `on_entry` until cancelled
    ///
    /// Only `level` and `search` apply. Cancellation (including before the
    /// source is started) returns `Ok(FollowEnd::Cancelled)` after the child
    /// is killed. On a pipe failure the open record is delivered before the
    /// error is returned.
    ///
    /// After `idle_flush` without output the open record is delivered as it
    /// stands. Lines that later continue it, and same-tick records that would
    /// have merged into it, arrive as follow-on records carrying the same
    /// timestamp and level.
    pub async fn follow<F>(
        &self,
        unit: &str,
        filter: &LogFilter,
        mut on_entry: F,
        cancel: CancellationToken,
    ) -> Result<FollowEnd>
    where
        F: FnMut(LogEntry) + Send,
    {
        validate_unit(unit)?;
        let mut pipeline = FollowPipeline::new(CompiledFilter::for_follow(filter)?);

        if cancel.is_cancelled() {
            debug!(unit, "follow cancelled before start");
            return Ok(FollowEnd::Cancelled);
        }

        let idle_flush = self.config.idle_flush.max(MIN_IDLE_FLUSH);

        // Starting
        let command = self.source.follow_command(unit);
        let mut process = FollowProcess::spawn(&command)?;
        info!(unit, source = self.source.name(), pid = ?process.id(), "follow streaming");

        // Streaming
        let mut buf = vec![0u8; self.config.read_chunk_size.max(1)];
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    process.terminate().await;
                    debug!(unit, "follow cancelled");
                    return Ok(FollowEnd::Cancelled);
                }

                read = tokio::time::timeout(idle_flush, process.read_chunk(&mut buf)) => {
                    match read {
                        Err(_idle) => pipeline.idle(&mut on_entry),
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => pipeline.feed(&buf[..n], &mut on_entry),
                        Ok(Err(e)) => {
                            pipeline.interrupt(&mut on_entry);
                            process.terminate().await;
                            warn!(unit, error = %e, "follow pipe failed");
                            return Err(LogError::StreamInterrupted(e));
                        }
                    }
                }
            }
        }

        // Output closed: everything read is complete, including an
        // unterminated last line
        pipeline.finish(&mut on_entry);
        match process.wait(&cancel).await {
            Ok(true) => {
                debug!(unit, "follow source ended");
                Ok(FollowEnd::Ended)
            }
            Ok(false) => Ok(FollowEnd::Cancelled),
            Err(e) => {
                warn!(unit, error = %e, "follow source exited with error");
                Err(e)
            }
        }
    }

    /// Like `follow`, but a failure is delivered to `on_entry` as a final
    /// ERROR record instead of being returned
    ///
    /// Returns `None` if the follow failed.
    pub async fn follow_in_band<F>(
        &self,
        unit: &str,
        filter: &LogFilter,
        mut on_entry: F,
        cancel: CancellationToken,
    ) -> Option<FollowEnd>
    where
        F: FnMut(LogEntry) + Send,
    {
        match self.follow(unit, filter, &mut on_entry, cancel).await {
            Ok(end) => {
                debug!(unit, ?end, "follow finished");
                Some(end)
            }
            Err(e) => {
                warn!(unit, error = %e, "follow failed");
                on_entry(stream_error_entry(&e));
                None
            }
        }
    }

    /// List units the source knows about
    pub async fn list_units(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let command = self.source.units_command();
        let raw = process::run_bounded(&command, self.config.units_timeout, cancel).await?;
        Ok(self.source.parse_units(&raw))
    }
}

/// Assemble, filter and order the output of a bounded query
///
/// `max_lines` keeps the most recent raw lines. Records that fail the filter
/// are dropped whole; the survivors are stably sorted by timestamp.
pub fn assemble_query(
    raw: &str,
    max_lines: Option<NonZeroUsize>,
    filter: &CompiledFilter,
    now: DateTime<Utc>,
) -> Vec<LogEntry> {
    let lines: Vec<&str> = raw.lines().collect();
    let start = match max_lines {
        Some(cap) => lines.len().saturating_sub(cap.get()),
        None => 0,
    };

    let mut assembler = LineAssembler::new(OrphanPolicy::Standalone).with_clock(Clock::Fixed(now));
    let mut entries: Vec<LogEntry> = lines[start..]
        .iter()
        .filter_map(|line| assembler.push_line(line))
        .collect();
    entries.extend(assembler.finish());

    entries.retain(|entry| filter.matches(entry));
    entries.sort_by_key(|entry| entry.timestamp);
    entries
}

/// Synthetic record reporting a failed follow
pub fn stream_error_entry(error: &LogError) -> LogEntry {
    LogEntry::new(Utc::now(), LogLevel::Error, format!("Log stream error: {error}"))
}

/// Unit names go straight into command lines and paths
fn validate_unit(unit: &str) -> Result<()> {
    let bad = unit.is_empty()
        || unit.starts_with('-')
        || unit.starts_with('.')
        || unit.contains(['/', '\\', '\0'])
        || unit.chars().any(char::is_control);
    if bad {
        return Err(LogError::InvalidUnit(unit.to_string()));
    }
    Ok(())
}

/// Bytes in, filtered records out, for one live follow
struct FollowPipeline {
    splitter: LineSplitter,
    assembler: LineAssembler,
    merger: TickMerger,
    filter: CompiledFilter,
}

impl FollowPipeline {
    fn new(filter: CompiledFilter) -> Self {
        Self {
            splitter: LineSplitter::new(),
            assembler: LineAssembler::new(OrphanPolicy::Discard),
            merger: TickMerger::new(),
            filter,
        }
    }

    fn feed<F: FnMut(LogEntry)>(&mut self, chunk: &[u8], emit: &mut F) {
        for line in self.splitter.feed(chunk) {
            if let Some(record) = self.assembler.push_line(&line) {
                self.merge(record, emit);
            }
        }
    }

    fn merge<F: FnMut(LogEntry)>(&mut self, record: LogEntry, emit: &mut F) {
        if let Some(done) = self.merger.push(record) {
            self.deliver(done, emit);
        }
    }

    fn deliver<F: FnMut(LogEntry)>(&self, entry: LogEntry, emit: &mut F) {
        if self.filter.matches(&entry) {
            emit(entry);
        }
    }

    /// Quiet pipe: hand out the open record without closing its header
    fn idle<F: FnMut(LogEntry)>(&mut self, emit: &mut F) {
        if let Some(record) = self.assembler.release() {
            self.merge(record, emit);
        }
        self.drain_merger(emit);
    }

    /// Close the open record and deliver anything held for merging
    fn flush<F: FnMut(LogEntry)>(&mut self, emit: &mut F) {
        if let Some(record) = self.assembler.finish() {
            self.merge(record, emit);
        }
        self.drain_merger(emit);
    }

    fn drain_merger<F: FnMut(LogEntry)>(&mut self, emit: &mut F) {
        if let Some(held) = self.merger.flush() {
            self.deliver(held, emit);
        }
    }

    /// End of stream: the trailing partial line is complete output
    fn finish<F: FnMut(LogEntry)>(&mut self, emit: &mut F) {
        if let Some(rest) = self.splitter.take_remainder() {
            if let Some(record) = self.assembler.push_line(&rest) {
                self.merge(record, emit);
            }
        }
        self.flush(emit);
    }

    /// Pipe failure: the trailing partial line is lost
    fn interrupt<F: FnMut(LogEntry)>(&mut self, emit: &mut F) {
        let dropped = self.splitter.discard_remainder();
        if dropped > 0 {
            debug!(bytes = dropped, "discarding unterminated line after pipe failure");
        }
        self.flush(emit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SCENARIO: &str = "2024/01/01 10:00:00 [x] [ERROR] boom\n\
                            stack trace line 1\n\
                            stack trace line 2\n\
                            2024/01/01 10:00:01 [x] [INFO] ok\n";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn query(raw: &str, filter: &LogFilter) -> Vec<LogEntry> {
        let compiled = CompiledFilter::new(filter, now()).unwrap();
        assemble_query(raw, filter.max_lines, &compiled, now())
    }

    fn collect_follow(chunks: &[&[u8]], filter: &LogFilter) -> Vec<LogEntry> {
        let mut pipeline = FollowPipeline::new(CompiledFilter::for_follow(filter).unwrap());
        let mut out: Vec<LogEntry> = Vec::new();
        let mut emit = |entry: LogEntry| out.push(entry);
        for chunk in chunks {
            pipeline.feed(chunk, &mut emit);
        }
        pipeline.finish(&mut emit);
        out
    }

    #[test]
    fn test_query_no_filter() {
        let entries = query(SCENARIO, &LogFilter::new());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[0].message, "boom\nstack trace line 1\nstack trace line 2");
        assert_eq!(entries[1].level, LogLevel::Info);
        assert_eq!(entries[1].message, "ok");
    }

    #[test]
    fn test_query_level_filter() {
        let entries = query(SCENARIO, &LogFilter::new().with_level("INFO"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "ok");
    }

    #[test]
    fn test_query_search_never_splits_record() {
        let entries = query(SCENARIO, &LogFilter::new().with_search("TRACE LINE 2"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "boom\nstack trace line 1\nstack trace line 2");
    }

    #[test]
    fn test_query_sorts_stably() {
        let raw = "2024/01/01 10:00:05 [x] [INFO] late\n\
                   2024/01/01 10:00:01 [x] [INFO] early-a\n\
                   2024/01/01 10:00:01 [x] [WARN] early-b\n";
        let messages: Vec<_> = query(raw, &LogFilter::new())
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, ["early-a", "early-b", "late"]);
    }

    #[test]
    fn test_query_max_lines_keeps_most_recent() {
        let entries = query(SCENARIO, &LogFilter::new().with_max_lines(2));
        // Cut lands on a continuation: it opens its own INFO record
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "ok");
        assert_eq!(entries[1].message, "stack trace line 2");
        assert_eq!(entries[1].timestamp, now());
    }

    #[test]
    fn test_query_since_bound() {
        let raw = "2024/01/01 10:00:00 [x] [INFO] old\n\
                   2024/01/01 11:30:00 [x] [INFO] recent\n";
        let entries = query(raw, &LogFilter::new().with_since("1h"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "recent");
    }

    #[test]
    fn test_query_is_idempotent() {
        let raw = format!("leading orphan\n{SCENARIO}2024/13/01 10:00:00 [x] [WARN] bad date\n");
        let filter = LogFilter::new();
        assert_eq!(query(&raw, &filter), query(&raw, &filter));
    }

    #[test]
    fn test_query_output_subset_of_unfiltered() {
        let unfiltered = query(SCENARIO, &LogFilter::new());
        for filter in [
            LogFilter::new().with_level("ERROR"),
            LogFilter::new().with_search("ok"),
            LogFilter::new().with_level("DEBUG"),
        ] {
            let filtered = query(SCENARIO, &filter);
            let mut cursor = unfiltered.iter();
            for entry in &filtered {
                assert!(cursor.any(|e| e == entry), "order or membership broken");
            }
        }
    }

    #[test]
    fn test_follow_partial_reads() {
        let out = collect_follow(
            &[b"2024/01/01 10:00:00 [x] [ER", b"ROR] boom\nstack", b" trace\n2024/01/01 10:00:01 [x] [INFO] ok\n"],
            &LogFilter::new(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "boom\nstack trace");
        assert_eq!(out[1].message, "ok");
    }

    #[test]
    fn test_follow_merges_same_tick() {
        let out = collect_follow(
            &[b"2024/01/01 10:00:00 [x] [INFO] part one\n2024/01/01 10:00:00 [x] [INFO] part two\n2024/01/01 10:00:00 [x] [WARN] other\n"],
            &LogFilter::new(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "part one\npart two");
        assert_eq!(out[1].level, LogLevel::Warn);
    }

    #[test]
    fn test_follow_drops_leading_orphans() {
        let out = collect_follow(
            &[b"mid-record tail\n2024/01/01 10:00:00 [x] [INFO] ok\n"],
            &LogFilter::new(),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "ok");
    }

    #[test]
    fn test_follow_filters_assembled_records() {
        let out = collect_follow(&[SCENARIO.as_bytes()], &LogFilter::new().with_search("trace line 1"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].level, LogLevel::Error);
    }

    #[test]
    fn test_follow_finish_keeps_unterminated_line() {
        let out = collect_follow(&[b"2024/01/01 10:00:00 [x] [INFO] no newline"], &LogFilter::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "no newline");
    }

    #[test]
    fn test_follow_interrupt_drops_unterminated_line() {
        let mut pipeline = FollowPipeline::new(CompiledFilter::for_follow(&LogFilter::new()).unwrap());
        let mut out: Vec<LogEntry> = Vec::new();
        let mut emit = |entry: LogEntry| out.push(entry);
        pipeline.feed(b"2024/01/01 10:00:00 [x] [INFO] open\n2024/01/01 10:00:01 [x] [INF", &mut emit);
        pipeline.interrupt(&mut emit);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "open");
    }

    #[test]
    fn test_follow_idle_release_keeps_late_continuation() {
        let mut pipeline = FollowPipeline::new(CompiledFilter::for_follow(&LogFilter::new()).unwrap());
        let mut out: Vec<LogEntry> = Vec::new();
        let mut emit = |entry: LogEntry| out.push(entry);

        pipeline.feed(b"2024/01/01 10:00:00 [x] [ERROR] boom\n", &mut emit);
        pipeline.idle(&mut emit);
        pipeline.idle(&mut emit);
        pipeline.feed(b"stack trace line 1\n2024/01/01 10:00:01 [x] [INFO] ok\n", &mut emit);
        pipeline.finish(&mut emit);

        let messages: Vec<_> = out.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["boom", "stack trace line 1", "ok"]);
        assert_eq!(out[1].level, LogLevel::Error);
        assert_eq!(out[1].timestamp, out[0].timestamp);
    }

    #[test]
    fn test_follow_idle_release_then_same_tick_record() {
        let mut pipeline = FollowPipeline::new(CompiledFilter::for_follow(&LogFilter::new()).unwrap());
        let mut out: Vec<LogEntry> = Vec::new();
        let mut emit = |entry: LogEntry| out.push(entry);

        pipeline.feed(b"2024/01/01 10:00:00 [x] [INFO] part one\n", &mut emit);
        pipeline.idle(&mut emit);
        pipeline.feed(b"2024/01/01 10:00:00 [x] [INFO] part two\n", &mut emit);
        pipeline.finish(&mut emit);

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].message, "part two");
        assert_eq!((out[1].timestamp, &out[1].level), (out[0].timestamp, &out[0].level));
    }

    #[test]
    fn test_stream_error_entry() {
        let entry = stream_error_entry(&LogError::Cancelled);
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "Log stream error: log request cancelled");
    }

    #[tokio::test]
    async fn test_follow_in_band_reports_failure_as_record() {
        let adapter = LogAdapter::new(
            Arc::new(crate::source::ShellSource::new(
                "true",
                "echo '2024/01/01 10:00:00 [x] [WARN] last'; echo 'unit gone' >&2; exit 1",
                "true",
            )),
            AdapterConfig::default(),
        );

        let mut out: Vec<LogEntry> = Vec::new();
        let end = adapter
            .follow_in_band("app", &LogFilter::new(), |entry: LogEntry| out.push(entry), CancellationToken::new())
            .await;

        assert!(end.is_none());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "last");
        assert_eq!(out[1].level, LogLevel::Error);
        assert!(out[1].message.contains("unit gone"), "{}", out[1].message);
    }

    #[test]
    fn test_validate_unit() {
        assert!(validate_unit("picoclaw").is_ok());
        assert!(validate_unit("my-app@1.service").is_ok());
        for bad in ["", "-f", "../etc/passwd", "a/b", "..", "bad\nname"] {
            assert!(matches!(validate_unit(bad), Err(LogError::InvalidUnit(_))), "{bad:?}");
        }
    }
}
