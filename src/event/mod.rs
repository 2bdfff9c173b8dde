//! Per-class query statistics.
//!
//! A `Class` holds the aggregated metrics of one query shape over one
//! interval. Slow-log classes accumulate raw values and compute their
//! statistics in `finalize`; performance_schema classes are built from
//! already-aggregated counters and set their statistics directly.

mod aggregator;

pub use aggregator::Aggregator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistics for a metric measured in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeStats {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub avg: f64,
    pub med: f64,
    pub p95: f64,
    pub max: f64,
    #[serde(skip)]
    vals: Vec<f64>,
}

impl TimeStats {
    /// Stats from counters that were already aggregated by the server.
    #[must_use]
    pub fn from_totals(cnt: u64, sum: f64, min: f64, avg: f64, max: f64) -> Self {
        Self {
            cnt,
            sum,
            min,
            avg,
            max,
            ..Self::default()
        }
    }

    pub fn add(&mut self, val: f64) {
        if self.cnt == 0 || val < self.min {
            self.min = val;
        }
        if val > self.max {
            self.max = val;
        }
        self.cnt += 1;
        self.sum += val;
        self.vals.push(val);
    }

    /// Merge already-finalized stats from another class.
    pub fn merge(&mut self, other: &Self) {
        if other.cnt == 0 {
            return;
        }
        if self.cnt == 0 || other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.cnt += other.cnt;
        self.sum += other.sum;
        #[allow(clippy::cast_precision_loss)]
        let avg = self.sum / self.cnt as f64;
        self.avg = avg;
        self.med = self.med.max(other.med);
        self.p95 = self.p95.max(other.p95);
    }

    fn finalize(&mut self, rate_limit: u32) {
        if self.vals.is_empty() {
            return;
        }
        self.vals.sort_by(f64::total_cmp);
        self.med = percentile(&self.vals, 50);
        self.p95 = percentile(&self.vals, 95);
        #[allow(clippy::cast_precision_loss)]
        let avg = self.sum / self.cnt as f64;
        self.avg = avg;

        if rate_limit > 1 {
            self.cnt *= u64::from(rate_limit);
            self.sum *= f64::from(rate_limit);
        }
        self.vals.clear();
    }
}

/// Statistics for a counted metric (rows, errors, temp tables, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberStats {
    pub cnt: u64,
    pub sum: u64,
    pub min: u64,
    pub avg: u64,
    pub med: u64,
    pub p95: u64,
    pub max: u64,
    #[serde(skip)]
    vals: Vec<u64>,
}

impl NumberStats {
    #[must_use]
    pub fn from_totals(cnt: u64, sum: u64) -> Self {
        Self {
            cnt,
            sum,
            avg: sum.checked_div(cnt).unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, val: u64) {
        if self.cnt == 0 || val < self.min {
            self.min = val;
        }
        if val > self.max {
            self.max = val;
        }
        self.cnt += 1;
        self.sum += val;
        self.vals.push(val);
    }

    pub fn merge(&mut self, other: &Self) {
        if other.cnt == 0 {
            return;
        }
        if self.cnt == 0 || other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.cnt += other.cnt;
        self.sum += other.sum;
        self.avg = self.sum / self.cnt;
        self.med = self.med.max(other.med);
        self.p95 = self.p95.max(other.p95);
    }

    fn finalize(&mut self, rate_limit: u32) {
        if self.vals.is_empty() {
            return;
        }
        self.vals.sort_unstable();
        self.med = percentile(&self.vals, 50);
        self.p95 = percentile(&self.vals, 95);
        self.avg = self.sum / self.cnt;

        if rate_limit > 1 {
            self.cnt *= u64::from(rate_limit);
            self.sum *= u64::from(rate_limit);
        }
        self.vals.clear();
    }
}

/// Count of events for which a boolean metric was true.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolStats {
    pub sum: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub time_metrics: BTreeMap<String, TimeStats>,
    pub number_metrics: BTreeMap<String, NumberStats>,
    pub bool_metrics: BTreeMap<String, BoolStats>,
}

impl Metrics {
    fn merge(&mut self, other: &Self) {
        for (name, stats) in &other.time_metrics {
            self.time_metrics.entry(name.clone()).or_default().merge(stats);
        }
        for (name, stats) in &other.number_metrics {
            self.number_metrics.entry(name.clone()).or_default().merge(stats);
        }
        for (name, stats) in &other.bool_metrics {
            self.bool_metrics.entry(name.clone()).or_default().sum += stats.sum;
        }
    }

    fn finalize(&mut self, rate_limit: u32) {
        for stats in self.time_metrics.values_mut() {
            stats.finalize(rate_limit);
        }
        for stats in self.number_metrics.values_mut() {
            stats.finalize(rate_limit);
        }
        if rate_limit > 1 {
            for stats in self.bool_metrics.values_mut() {
                stats.sum *= u64::from(rate_limit);
            }
        }
    }
}

/// Example of one real statement in a class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub query_time: f64,
    pub db: String,
    pub query: String,
    pub ts: Option<DateTime<Utc>>,
}

/// Aggregated metrics for one query shape over one interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: String,
    pub fingerprint: String,
    pub metrics: Metrics,
    pub total_queries: u64,
    pub unique_queries: u64,
    pub example: Option<Example>,
    #[serde(skip)]
    sample: bool,
}

impl Class {
    #[must_use]
    pub fn new(id: &str, fingerprint: &str, sample: bool) -> Self {
        Self {
            id: id.to_string(),
            fingerprint: fingerprint.to_string(),
            unique_queries: 1,
            sample,
            ..Self::default()
        }
    }

    /// The global class of an interval, the union of all its classes.
    #[must_use]
    pub fn global(sample: bool) -> Self {
        Self {
            sample,
            ..Self::default()
        }
    }

    /// Fold another class into this one (global totals, low-ranking queries).
    pub fn add_class(&mut self, other: &Self) {
        self.unique_queries += 1;
        self.total_queries += other.total_queries;
        self.metrics.merge(&other.metrics);
    }

    /// Query time sum, used to rank classes.
    #[must_use]
    pub fn query_time_sum(&self) -> f64 {
        self.metrics
            .time_metrics
            .get("Query_time")
            .map_or(0.0, |stats| stats.sum)
    }

    pub(crate) fn finalize(&mut self, rate_limit: u32) {
        self.metrics.finalize(rate_limit);
        if rate_limit > 1 {
            self.total_queries *= u64::from(rate_limit);
        }
    }
}

fn percentile<T: Copy + Default>(sorted: &[T], pct: usize) -> T {
    if sorted.is_empty() {
        return T::default();
    }
    let idx = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted.get(idx).copied().unwrap_or_default()
}
