use super::{Interval, QanResult};
use crate::event::Class;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id of the class that absorbs everything past the report limit.
pub const LOW_RANKING_CLASS_ID: &str = "0";

/// One interval's result, ready to be spooled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub instance: String,
    pub interval: u64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub slow_log_file: Option<String>,
    pub start_offset: u64,
    pub end_offset: u64,
    pub stop_offset: u64,
    /// Seconds
    pub run_time: f64,
    pub rate_limit: u32,
    pub error: Option<String>,
    pub global: Option<Class>,
    pub class: Vec<Class>,
}

impl Report {
    /// Build a report, keeping the `limit` classes with the highest total
    /// query time (0 keeps all) and merging the rest into one class.
    #[must_use]
    pub fn new(instance: &str, interval: &Interval, result: QanResult, limit: usize) -> Self {
        let QanResult {
            global,
            mut class,
            run_time,
            stop_offset,
            rate_limit,
            error,
        } = result;

        class.sort_by(|a, b| {
            b.query_time_sum()
                .total_cmp(&a.query_time_sum())
                .then_with(|| a.id.cmp(&b.id))
        });

        if limit > 0 && class.len() > limit {
            let rest = class.split_off(limit);
            let mut low = Class::global(false);
            low.id = LOW_RANKING_CLASS_ID.to_string();
            low.fingerprint = LOW_RANKING_CLASS_ID.to_string();
            for c in &rest {
                low.add_class(c);
            }
            class.push(low);
        }

        Self {
            instance: instance.to_string(),
            interval: interval.number,
            start_ts: interval.start_time,
            end_ts: interval.stop_time,
            slow_log_file: interval
                .filename
                .as_ref()
                .map(|f| f.display().to_string()),
            start_offset: interval.start_offset,
            end_offset: interval.end_offset,
            stop_offset,
            run_time: run_time.as_secs_f64(),
            rate_limit,
            error,
            global,
            class,
        }
    }
}
