//! Log ingestion for logtide
//!
//! This crate turns the raw text of an external log source into assembled,
//! leveled records, either as a bounded query or as a live, cancellable tail.

mod adapter;
mod assembler;
mod error;
mod filter;
mod merge;
mod process;
mod source;
mod tail;

pub use adapter::{AdapterConfig, FollowEnd, LogAdapter, assemble_query, stream_error_entry};
pub use assembler::{Clock, LineAssembler, OrphanPolicy, assemble, is_header, parse_header};
pub use error::{LogError, Result};
pub use filter::CompiledFilter;
pub use merge::TickMerger;
pub use process::{FollowProcess, LineSplitter, run_bounded};
pub use source::{FileSource, JournaldSource, LogSource, ShellSource, SourceCommand};
pub use tail::LiveTail;

// Re-export types used in our public API
pub use logtide_types::{LogEntry, LogFilter, LogLevel, LogQueryResult, SinceSpec};
