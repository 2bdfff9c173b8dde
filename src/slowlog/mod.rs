//! Slow query log events and the parser boundary.
//!
//! The QAN slow-log worker only owns offsets, rotation and per-event
//! dispatch; turning log lines into events is delegated to a `LogParser`.

mod parser;

pub use parser::SlowLogParser;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

/// One statement read from the slow log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// Byte offset of the first line of the event.
    pub offset: u64,
    /// `SET timestamp=N;`
    pub ts: Option<DateTime<Utc>>,
    /// `# Time:` header, in the server's local time.
    pub local_time: Option<NaiveDateTime>,
    pub admin: bool,
    pub query: String,
    pub user: String,
    pub host: String,
    pub db: String,
    pub time_metrics: BTreeMap<String, f64>,
    pub number_metrics: BTreeMap<String, u64>,
    pub bool_metrics: BTreeMap<String, bool>,
    /// `Log_slow_rate_type` (Percona Server sampling).
    pub rate_type: Option<String>,
    /// `Log_slow_rate_limit`
    pub rate_limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ParserOptions {
    pub start_offset: u64,
    pub filter_admin_commands: bool,
}

/// Produces events from a slow log file.
pub trait LogParser: Send {
    /// Next complete event, `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file cannot be read.
    fn next_event(&mut self) -> Result<Option<Event>>;

    /// Bytes of the file consumed so far, i.e. the current file position.
    fn offset(&self) -> u64;
}

/// Builds a parser for an opened slow log.
pub type ParserFactory =
    Arc<dyn Fn(File, ParserOptions) -> Result<Box<dyn LogParser>> + Send + Sync>;

/// Factory for the built-in line parser.
#[must_use]
pub fn default_parser_factory() -> ParserFactory {
    Arc::new(|file, opts| {
        let parser = SlowLogParser::new(file, &opts)?;
        Ok(Box::new(parser) as Box<dyn LogParser>)
    })
}
