//! Query analytics: interval sampling of per-query statistics.
//!
//! The flow per MySQL instance is Clock → tick → `IntervalIter` → `Interval`
//! → `Analyzer` → `Worker::{setup, run, cleanup}` → `QanResult` → `Spooler`.

pub mod analyzer;
pub mod config;
pub mod iter;
pub mod perfschema;
pub mod report;
pub mod slowlog;
pub mod spool;
pub mod status;

use crate::event::Class;
use crate::ticker::Tick;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One bounded sampling window.
///
/// `number` grows by one per cycle and, for the slow log, `start_offset`
/// of interval N+1 equals `end_offset` of interval N. Anything else is a gap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interval {
    pub number: u64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub filename: Option<PathBuf>,
    pub start_offset: u64,
    pub end_offset: u64,
}

/// Output of one worker run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QanResult {
    pub global: Option<Class>,
    pub class: Vec<Class>,
    pub run_time: Duration,
    pub stop_offset: u64,
    pub rate_limit: u32,
    pub error: Option<String>,
}

impl QanResult {
    /// A result carrying only an error, for runs that produced no data.
    #[must_use]
    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Stop signal shared between a worker and its owner. Stopping is terminal.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// One extraction strategy (slow log or performance_schema).
pub trait Worker: Send {
    fn name(&self) -> &str;

    /// Prepare for `interval`; may rewrite its file name and end offset.
    fn setup<'a>(&'a mut self, interval: &'a mut Interval) -> BoxFuture<'a, Result<()>>;

    /// Extract the interval's data. `Ok(None)` means nothing to report.
    fn run(&mut self) -> BoxFuture<'_, Result<Option<QanResult>>>;

    fn cleanup(&mut self) -> BoxFuture<'_, Result<()>>;

    fn stop_handle(&self) -> StopHandle;

    /// Forget baseline state, e.g. after a MySQL restart.
    fn reset(&mut self);

    fn status(&self) -> BTreeMap<String, String>;
}

/// Turns ticks into intervals for one worker type.
pub trait IntervalSource: Send {
    /// `Ok(None)` when the tick only opens the first interval.
    fn tick(&mut self, now: Tick) -> BoxFuture<'_, Result<Option<Interval>>>;
}
