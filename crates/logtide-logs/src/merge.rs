use logtide_types::LogEntry;

/// Joins consecutive records that share a timestamp and level
///
/// Sources that split one logical message over several header lines within
/// the same second are read back as one record. Best-effort only: two
/// unrelated messages logged in the same second at the same level are joined
/// too. Used by live follow.
#[derive(Debug, Default)]
pub struct TickMerger {
    held: Option<LogEntry>,
}

impl TickMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer the next assembled record; returns the previous one once it can
    /// no longer grow
    pub fn push(&mut self, entry: LogEntry) -> Option<LogEntry> {
        match self.held.as_mut() {
            Some(held) if held.timestamp == entry.timestamp && held.level == entry.level => {
                held.append_line(&entry.message);
                None
            }
            _ => self.held.replace(entry),
        }
    }

    /// Release the held record
    pub fn flush(&mut self) -> Option<LogEntry> {
        self.held.take()
    }

    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }
}
