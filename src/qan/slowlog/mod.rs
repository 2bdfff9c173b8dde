//! Query analytics from the slow query log.
//!
//! Each interval is a byte range of the log. The worker parses that range,
//! fingerprints every statement and aggregates the events by class. It also
//! rotates the log once it grows past the configured size.

mod fingerprinter;
mod iter;

pub use fingerprinter::{FingerprintFn, Fingerprinter};
pub use iter::{FilenameFn, SlowLogIntervals};

use super::config::QanConfig;
use super::{Interval, QanResult, StopHandle, Worker};
use crate::event::Aggregator;
use crate::mysql::Connector;
use crate::query::{self, FingerprintError};
use crate::slowlog::{Event, ParserFactory, ParserOptions, default_parser_factory};
use anyhow::{Context, Result, anyhow};
use chrono::{TimeDelta, Utc};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, info, instrument, warn};

/// Events buffered between the parser and the worker.
const EVENT_BUFFER: usize = 100;

/// How long cleanup waits for a parser that was told to stop.
const PARSER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const STOPPED_MESSAGE: &str = "stopped gracefully";

/// What one run parses, fixed at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub slow_log_file: PathBuf,
    pub start_offset: u64,
    pub end_offset: u64,
    pub run_time: Duration,
    pub example_queries: bool,
}

#[derive(Debug, Default)]
struct RunStats {
    events: u64,
    skipped: u64,
    rotations: u64,
    last_job: Option<String>,
    last_error: Option<String>,
}

/// Why the event loop ended.
enum LoopEnd {
    /// End of the log, resume from the parser position.
    Eof,
    /// Reached the end of the interval at this offset.
    Offset(u64),
    /// Ended early with an error message, resume after the last event.
    Early(String),
}

/// `Log_slow_rate_type` and `Log_slow_rate_limit` of one event.
type Rate = (Option<String>, u32);

fn describe_rate((kind, limit): &Rate) -> String {
    format!("{}:{limit}", kind.as_deref().unwrap_or("unknown"))
}

/// Worker parsing byte ranges of the slow log.
pub struct SlowLogWorker {
    name: String,
    config: QanConfig,
    conn: Arc<dyn Connector>,
    parser: ParserFactory,
    fingerprinter: Fingerprinter,
    stop: StopHandle,
    job: Option<Job>,
    old_files: BTreeMap<u64, PathBuf>,
    utc_offset: TimeDelta,
    stats: RunStats,
    parser_task: Option<JoinHandle<Result<u64>>>,
}

impl SlowLogWorker {
    #[must_use]
    pub fn new(name: &str, config: QanConfig, conn: Arc<dyn Connector>) -> Self {
        Self {
            name: name.to_string(),
            config,
            conn,
            parser: default_parser_factory(),
            fingerprinter: Fingerprinter::new(),
            stop: StopHandle::new(),
            job: None,
            old_files: BTreeMap::new(),
            utc_offset: TimeDelta::zero(),
            stats: RunStats::default(),
            parser_task: None,
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: ParserFactory) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    /// The job prepared by the last `setup`.
    #[must_use]
    pub const fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// Rotated files waiting to be removed, by interval number.
    #[must_use]
    pub const fn old_files(&self) -> &BTreeMap<u64, PathBuf> {
        &self.old_files
    }

    /// Stop logging, rename the log to `<file>-<unix time>`, start logging again.
    /// Returns the new name and its final size.
    #[instrument(skip(self), level = "info", err, fields(otel.kind = "internal"))]
    async fn rotate(&mut self, file: &Path) -> Result<(PathBuf, u64)> {
        self.conn.connect().await?;
        self.conn.exec(&self.config.stop_statements()).await?;

        let mut renamed = file.as_os_str().to_owned();
        renamed.push(format!("-{}", Utc::now().timestamp()));
        let renamed = PathBuf::from(renamed);

        let moved = tokio::fs::rename(file, &renamed).await;
        // Logging is restarted even if the rename failed.
        let started = self.conn.exec(&self.config.start_statements()).await;
        moved.with_context(|| format!("failed to rename {}", file.display()))?;
        started?;

        let size = tokio::fs::metadata(&renamed)
            .await
            .with_context(|| format!("cannot stat {}", renamed.display()))?
            .len();

        self.stats.rotations += 1;
        info!(instance = %self.name, file = %renamed.display(), size, "rotated slow log");
        Ok((renamed, size))
    }

    async fn refresh_utc_offset(&mut self) {
        if let Err(e) = self.conn.connect().await {
            debug!(instance = %self.name, error = %e, "cannot connect to read UTC offset");
            return;
        }
        match self.conn.utc_offset().await {
            Ok(offset) => self.utc_offset = offset,
            Err(e) => debug!(instance = %self.name, error = %e, "cannot read UTC offset"),
        }
    }

    /// Spawn the parser on a blocking thread, feeding events to `tx`.
    /// Resolves to the parser position when it stops.
    fn spawn_parser(&self, job: &Job, tx: mpsc::Sender<Event>) -> JoinHandle<Result<u64>> {
        let factory = Arc::clone(&self.parser);
        let path = job.slow_log_file.clone();
        let opts = ParserOptions {
            start_offset: job.start_offset,
            filter_admin_commands: false,
        };

        tokio::task::spawn_blocking(move || {
            let file = File::open(&path)
                .with_context(|| format!("cannot open slow log {}", path.display()))?;
            let mut parser = factory(file, opts)?;
            // The worker closes the channel to stop the parser early.
            while !tx.is_closed() {
                let Some(event) = parser.next_event()? else {
                    break;
                };
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            Ok(parser.offset())
        })
    }

    /// Wait for a parser left running by an early end of `parse`.
    async fn join_parser(&mut self) {
        let Some(task) = self.parser_task.take() else {
            return;
        };

        match tokio::time::timeout(PARSER_JOIN_TIMEOUT, task).await {
            Ok(Ok(Ok(offset))) => debug!(instance = %self.name, offset, "slow log parser stopped"),
            Ok(Ok(Err(e))) => debug!(instance = %self.name, error = %e, "slow log parser failed"),
            Ok(Err(e)) => warn!(instance = %self.name, error = %e, "slow log parser crashed"),
            Err(_) => warn!(instance = %self.name, "slow log parser did not stop in time"),
        }
    }

    async fn parse(&mut self, job: &Job) -> Result<QanResult> {
        self.join_parser().await;

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + job.run_time;
        let stop = self.stop.clone();

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let parser = self.spawn_parser(job, tx);

        let mut aggregator = Aggregator::new(job.example_queries, self.utc_offset);
        let mut rate: Option<Rate> = None;
        let mut last_offset = job.start_offset;

        let end = loop {
            let event = tokio::select! {
                biased;
                () = stop.stopped() => break LoopEnd::Early(STOPPED_MESSAGE.to_string()),
                () = sleep_until(deadline) => break LoopEnd::Early(format!(
                    "timeout parsing {} after {:.1}s",
                    job.slow_log_file.display(),
                    job.run_time.as_secs_f64()
                )),
                event = rx.recv() => event,
            };

            let Some(event) = event else {
                break LoopEnd::Eof;
            };

            if event.offset >= job.end_offset {
                break LoopEnd::Offset(event.offset);
            }

            if event.rate_limit > 0 {
                let current = (event.rate_type.clone(), event.rate_limit);
                match &rate {
                    None => rate = Some(current),
                    Some(first) if *first != current => {
                        break LoopEnd::Early(format!(
                            "slow log has mixed rate limits: {} and {}",
                            describe_rate(first),
                            describe_rate(&current)
                        ));
                    }
                    Some(_) => {}
                }
            }

            last_offset = event.offset;
            match self.fingerprinter.fingerprint(&event.query).await {
                Ok(fingerprint) => {
                    aggregator.add_event(&event, &query::id(&fingerprint), &fingerprint);
                    self.stats.events += 1;
                }
                Err(FingerprintError::Crashed) => {
                    warn!(instance = %self.name, offset = event.offset, "fingerprint crashed, skipping event");
                    self.stats.skipped += 1;
                }
                Err(e) => {
                    debug!(instance = %self.name, offset = event.offset, error = %e, "skipping event");
                    self.stats.skipped += 1;
                }
            }
        };
        drop(rx);

        let mut result = QanResult::default();
        match end {
            LoopEnd::Eof => {
                result.stop_offset = parser
                    .await
                    .map_err(|e| anyhow!("slow log parser crashed: {e}"))??;
            }
            LoopEnd::Offset(offset) => {
                result.stop_offset = offset;
                self.parser_task = Some(parser);
            }
            LoopEnd::Early(message) => {
                warn!(instance = %self.name, "{message}");
                result.stop_offset = last_offset;
                result.error = Some(message);
                self.parser_task = Some(parser);
            }
        }

        let limit = rate.map_or(0, |(_, limit)| limit);
        if !aggregator.is_empty() {
            let (global, classes) = aggregator.finalize(limit);
            result.global = Some(global);
            result.class = classes;
        }
        result.rate_limit = limit;
        result.run_time = started.elapsed();

        Ok(result)
    }
}

impl Worker for SlowLogWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup<'a>(&'a mut self, interval: &'a mut Interval) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.job = None;
            let Some(file) = interval.filename.clone() else {
                return Err(anyhow!("interval {} has no slow log file", interval.number));
            };

            if self.config.max_slow_log_size > 0
                && interval.end_offset >= self.config.max_slow_log_size
            {
                let (renamed, size) = self.rotate(&file).await?;
                interval.filename = Some(renamed.clone());
                interval.end_offset = size;
                if self.config.remove_old_slow_logs {
                    self.old_files.insert(interval.number, renamed);
                }
            }

            self.refresh_utc_offset().await;

            let job = Job {
                slow_log_file: interval.filename.clone().unwrap_or(file),
                start_offset: interval.start_offset,
                end_offset: interval.end_offset,
                run_time: self.config.worker_run_time(),
                example_queries: self.config.example_queries,
            };
            debug!(instance = %self.name, job = ?job, "slow log job");
            self.job = Some(job);
            Ok(())
        })
    }

    #[instrument(skip(self), level = "info", err, fields(worker = "slowlog", otel.kind = "internal"))]
    fn run(&mut self) -> BoxFuture<'_, Result<Option<QanResult>>> {
        Box::pin(async move {
            let Some(job) = self.job.clone() else {
                return Ok(None);
            };
            if self.stop.is_stopped() || job.start_offset >= job.end_offset {
                return Ok(None);
            }

            self.stats.last_job = Some(format!(
                "{} {}..{}",
                job.slow_log_file.display(),
                job.start_offset,
                job.end_offset
            ));

            let result = match self.parse(&job).await {
                Ok(result) => result,
                Err(e) => {
                    self.stats.last_error = Some(e.to_string());
                    return Err(e);
                }
            };
            self.stats.last_error.clone_from(&result.error);

            if result.global.is_none() && result.error.is_none() {
                return Ok(None);
            }
            Ok(Some(result))
        })
    }

    fn cleanup(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.join_parser().await;

            let queued: Vec<(u64, PathBuf)> = self
                .old_files
                .iter()
                .map(|(n, f)| (*n, f.clone()))
                .collect();

            for (number, file) in queued {
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => {
                        info!(instance = %self.name, file = %file.display(), "removed old slow log");
                        self.old_files.remove(&number);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        self.old_files.remove(&number);
                    }
                    Err(e) => {
                        warn!(instance = %self.name, file = %file.display(), error = %e, "cannot remove old slow log");
                    }
                }
            }

            self.job = None;
            Ok(())
        })
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn reset(&mut self) {
        info!(instance = %self.name, "resetting slow log state");
        self.utc_offset = TimeDelta::zero();
        self.stats.last_error = None;
    }

    fn status(&self) -> BTreeMap<String, String> {
        let mut status = format!(
            "Parsed {} events, skipped {}, rotations {}, fingerprinter restarts {}",
            self.stats.events,
            self.stats.skipped,
            self.stats.rotations,
            self.fingerprinter.restarts()
        );
        if let Some(job) = &self.stats.last_job {
            status.push_str(", last job: ");
            status.push_str(job);
        }
        if let Some(e) = &self.stats.last_error {
            status.push_str(", last error: ");
            status.push_str(e);
        }
        BTreeMap::from([(format!("{}-worker", self.name), status)])
    }
}
