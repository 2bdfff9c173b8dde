//! Query analytics from `performance_schema.events_statements_summary_by_digest`.
//!
//! The digest table holds counters that only grow, so each run reads a full
//! snapshot and reports the difference to the previous one. Two snapshots
//! are needed before anything can be reported.

mod iter;
mod snapshot;

pub use iter::PerfSchemaIntervals;
pub use snapshot::{
    DigestClass, DigestRow, DigestSource, MySqlDigestSource, OVERFLOW_CLASS_ID,
    OVERFLOW_FINGERPRINT, Snapshot, class_id,
};

use super::{Interval, QanResult, StopHandle, Worker};
use crate::event::{Class, NumberStats, TimeStats};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const PICOSECOND: f64 = 1e-12;

type Counter = fn(&DigestRow) -> u64;

/// Counters reported as number metrics, by metric name.
const NUMBER_METRICS: &[(&str, Counter)] = &[
    ("Errors", |r: &DigestRow| r.sum_errors),
    ("Warnings", |r: &DigestRow| r.sum_warnings),
    ("Rows_affected", |r: &DigestRow| r.sum_rows_affected),
    ("Rows_sent", |r: &DigestRow| r.sum_rows_sent),
    ("Rows_examined", |r: &DigestRow| r.sum_rows_examined),
    ("Tmp_disk_tables", |r: &DigestRow| r.sum_created_tmp_disk_tables),
    ("Tmp_tables", |r: &DigestRow| r.sum_created_tmp_tables),
    ("Full_join", |r: &DigestRow| r.sum_select_full_join),
    ("Full_range_join", |r: &DigestRow| r.sum_select_full_range_join),
    ("Select_range", |r: &DigestRow| r.sum_select_range),
    ("Select_range_check", |r: &DigestRow| r.sum_select_range_check),
    ("Full_scan", |r: &DigestRow| r.sum_select_scan),
    ("Merge_passes", |r: &DigestRow| r.sum_sort_merge_passes),
    ("Sort_range", |r: &DigestRow| r.sum_sort_range),
    ("Sort_rows", |r: &DigestRow| r.sum_sort_rows),
    ("Sort_scan", |r: &DigestRow| r.sum_sort_scan),
    ("No_index_used", |r: &DigestRow| r.sum_no_index_used),
    ("No_good_index_used", |r: &DigestRow| r.sum_no_good_index_used),
];

#[allow(clippy::cast_precision_loss)]
fn seconds(picoseconds: u64) -> f64 {
    picoseconds as f64 * PICOSECOND
}

/// Running aggregate of the rows of one class that changed in an interval.
#[derive(Debug, Default)]
struct ClassDelta {
    /// Rows (instances) that contributed.
    n: u64,
    count: u64,
    sum_timer: u64,
    min_timer: u64,
    max_timer: u64,
    avg_timer_sum: u64,
    lock_time: u64,
    counters: [u64; NUMBER_METRICS.len()],
}

impl ClassDelta {
    /// Add `row`, diffed against `base` when the row was seen before.
    fn add(&mut self, row: &DigestRow, base: Option<&DigestRow>) {
        let delta = |f: Counter| f(row).saturating_sub(base.map_or(0, f));

        self.n += 1;
        self.count += delta(|r| r.count_star);
        self.sum_timer += delta(|r| r.sum_timer_wait);
        self.lock_time += delta(|r| r.sum_lock_time);

        // Min and max are taken as-is; they cannot be diffed.
        if row.min_timer_wait > 0 && (self.min_timer == 0 || row.min_timer_wait < self.min_timer) {
            self.min_timer = row.min_timer_wait;
        }
        self.max_timer = self.max_timer.max(row.max_timer_wait);
        self.avg_timer_sum += row.avg_timer_wait;

        for (total, (_, counter)) in self.counters.iter_mut().zip(NUMBER_METRICS) {
            *total += delta(*counter);
        }
    }

    /// Average is the mean of the per-row averages, not weighted by count.
    #[allow(clippy::cast_precision_loss)]
    fn into_class(self, id: &str, fingerprint: &str) -> Class {
        let mut class = Class::new(id, fingerprint, false);
        class.total_queries = self.count;

        let avg = if self.n == 0 {
            0.0
        } else {
            self.avg_timer_sum as f64 / self.n as f64 * PICOSECOND
        };
        class.metrics.time_metrics.insert(
            "Query_time".to_string(),
            TimeStats::from_totals(
                self.count,
                seconds(self.sum_timer),
                seconds(self.min_timer),
                avg,
                seconds(self.max_timer),
            ),
        );
        class.metrics.time_metrics.insert(
            "Lock_time".to_string(),
            TimeStats::from_totals(self.count, seconds(self.lock_time), 0.0, 0.0, 0.0),
        );
        for (total, (name, _)) in self.counters.iter().zip(NUMBER_METRICS) {
            class
                .metrics
                .number_metrics
                .insert((*name).to_string(), NumberStats::from_totals(self.count, *total));
        }

        class
    }
}

/// Diff two snapshots. `None` when no class executed in between.
fn prepare_result(prev: &Snapshot, curr: &Snapshot) -> Option<QanResult> {
    let mut global = Class::global(false);
    let mut classes = Vec::new();

    for (id, class) in curr {
        let prev_rows = prev.get(id).map(|c| &c.rows);
        let mut delta = ClassDelta::default();

        for (schema, row) in &class.rows {
            match prev_rows.and_then(|rows| rows.get(schema)) {
                Some(base) if base.count_star == row.count_star => {}
                Some(base) if base.count_star < row.count_star => delta.add(row, Some(base)),
                // New, or the counters were truncated since the last snapshot.
                _ => delta.add(row, None),
            }
        }

        if delta.n == 0 {
            continue;
        }

        let class = delta.into_class(id, &class.digest_text);
        global.add_class(&class);
        classes.push(class);
    }

    if classes.is_empty() {
        return None;
    }

    Some(QanResult {
        global: Some(global),
        class: classes,
        ..QanResult::default()
    })
}

#[derive(Debug, Default)]
struct RunStats {
    rows: usize,
    fetch_time: Duration,
    prep_time: Duration,
    errors: u64,
    last_error: Option<String>,
}

/// Worker diffing consecutive digest table snapshots.
pub struct PerfSchemaWorker {
    name: String,
    source: Box<dyn DigestSource>,
    stop: StopHandle,
    prev: Option<Snapshot>,
    curr: Option<Snapshot>,
    last_interval: Option<(u64, DateTime<Utc>)>,
    stats: RunStats,
}

impl PerfSchemaWorker {
    #[must_use]
    pub fn new(name: &str, source: Box<dyn DigestSource>) -> Self {
        Self {
            name: name.to_string(),
            source,
            stop: StopHandle::new(),
            prev: None,
            curr: None,
            last_interval: None,
            stats: RunStats::default(),
        }
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let rows = self.source.rows().await?;
        let mut snapshot = Snapshot::new();

        for row in rows {
            let class = match snapshot.entry(class_id(row.digest.as_deref())) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let digest_text = self.digest_text(e.key(), row.digest.as_deref()).await?;
                    e.insert(DigestClass {
                        digest_text,
                        rows: BTreeMap::new(),
                    })
                }
            };
            class
                .rows
                .insert(row.schema_name.clone().unwrap_or_default(), row);
        }

        Ok(snapshot)
    }

    async fn digest_text(&self, id: &str, digest: Option<&str>) -> Result<String> {
        if let Some(known) = self.prev.as_ref().and_then(|prev| prev.get(id))
            && !known.digest_text.is_empty()
        {
            return Ok(known.digest_text.clone());
        }

        let text = self.source.digest_text(digest).await?.unwrap_or_default();
        if text.is_empty() && id == OVERFLOW_CLASS_ID {
            return Ok(OVERFLOW_FINGERPRINT.to_string());
        }
        Ok(text)
    }

    fn record_error(&mut self, error: &anyhow::Error) {
        self.stats.errors += 1;
        self.stats.last_error = Some(error.to_string());
    }
}

impl Worker for PerfSchemaWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup<'a>(&'a mut self, interval: &'a mut Interval) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Some((number, start)) = self.last_interval
                && (interval.number != number + 1 || interval.start_time < start)
            {
                warn!(
                    instance = %self.name,
                    expected = number + 1,
                    got = interval.number,
                    "interval out of sequence, resetting baseline"
                );
                self.reset();
            }
            self.last_interval = Some((interval.number, interval.start_time));
            Ok(())
        })
    }

    #[instrument(skip(self), level = "info", err, fields(worker = "perfschema", otel.kind = "internal"))]
    fn run(&mut self) -> BoxFuture<'_, Result<Option<QanResult>>> {
        Box::pin(async move {
            self.curr = None;
            if self.stop.is_stopped() {
                return Ok(None);
            }

            if let Err(e) = self.source.connect().await {
                warn!(instance = %self.name, error = %e, "cannot connect to MySQL");
                return Ok(None);
            }

            let started = Instant::now();
            let curr = match self.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.record_error(&e);
                    return Err(e);
                }
            };
            self.stats.fetch_time = started.elapsed();
            self.stats.rows = curr.values().map(|c| c.rows.len()).sum();

            let Some(prev) = self.prev.as_ref() else {
                debug!(instance = %self.name, rows = self.stats.rows, "first snapshot, nothing to report");
                self.curr = Some(curr);
                return Ok(None);
            };

            let prep = Instant::now();
            let result = prepare_result(prev, &curr);
            self.stats.prep_time = prep.elapsed();
            self.curr = Some(curr);

            Ok(result.map(|mut result| {
                result.run_time = started.elapsed();
                result
            }))
        })
    }

    fn cleanup(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // A failed run keeps the previous baseline.
            if let Some(curr) = self.curr.take() {
                self.prev = Some(curr);
            }
            Ok(())
        })
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn reset(&mut self) {
        info!(instance = %self.name, "resetting performance_schema baseline");
        self.prev = None;
        self.curr = None;
        self.stats.errors = 0;
        self.stats.last_error = None;
    }

    fn status(&self) -> BTreeMap<String, String> {
        let mut status = format!(
            "Rows {}, fetch {:.3}s, prep {:.3}s, errors {}",
            self.stats.rows,
            self.stats.fetch_time.as_secs_f64(),
            self.stats.prep_time.as_secs_f64(),
            self.stats.errors
        );
        if let Some(e) = &self.stats.last_error {
            status.push_str(", last error: ");
            status.push_str(e);
        }
        BTreeMap::from([(format!("{}-worker", self.name), status)])
    }
}
