use super::{Class, Example};
use crate::slowlog::Event;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;

/// Groups slow-log events into classes by fingerprint id.
#[derive(Debug)]
pub struct Aggregator {
    samples: bool,
    utc_offset: TimeDelta,
    global: Class,
    classes: BTreeMap<String, Class>,
}

impl Aggregator {
    /// `samples` keeps one example query per class; `utc_offset` is the
    /// MySQL server's offset from UTC, used for `# Time:` headers.
    #[must_use]
    pub fn new(samples: bool, utc_offset: TimeDelta) -> Self {
        Self {
            samples,
            utc_offset,
            global: Class::global(false),
            classes: BTreeMap::new(),
        }
    }

    pub fn add_event(&mut self, event: &Event, id: &str, fingerprint: &str) {
        let samples = self.samples;
        let class = self
            .classes
            .entry(id.to_string())
            .or_insert_with(|| Class::new(id, fingerprint, samples));

        let ts = event_time(event, self.utc_offset);
        add_event(class, event, ts);
        add_event(&mut self.global, event, ts);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Compute statistics and return the global class and the per-query classes.
    #[must_use]
    pub fn finalize(mut self, rate_limit: u32) -> (Class, Vec<Class>) {
        let mut classes: Vec<Class> = std::mem::take(&mut self.classes).into_values().collect();
        for class in &mut classes {
            class.finalize(rate_limit);
        }

        self.global.finalize(rate_limit);
        self.global.unique_queries = classes.len() as u64;

        (self.global, classes)
    }
}

fn event_time(event: &Event, utc_offset: TimeDelta) -> Option<DateTime<Utc>> {
    event.ts.or_else(|| {
        event
            .local_time
            .map(|local| DateTime::from_naive_utc_and_offset(local - utc_offset, Utc))
    })
}

fn add_event(class: &mut Class, event: &Event, ts: Option<DateTime<Utc>>) {
    class.total_queries += 1;

    for (name, val) in &event.time_metrics {
        class
            .metrics
            .time_metrics
            .entry(name.clone())
            .or_default()
            .add(*val);
    }
    for (name, val) in &event.number_metrics {
        class
            .metrics
            .number_metrics
            .entry(name.clone())
            .or_default()
            .add(*val);
    }
    for (name, val) in &event.bool_metrics {
        let stats = class.metrics.bool_metrics.entry(name.clone()).or_default();
        if *val {
            stats.sum += 1;
        }
    }

    if !class.sample {
        return;
    }

    let query_time = event.time_metrics.get("Query_time").copied().unwrap_or(0.0);
    let slower = class
        .example
        .as_ref()
        .is_none_or(|example| query_time > example.query_time);
    if slower {
        class.example = Some(Example {
            query_time,
            db: event.db.clone(),
            query: event.query.clone(),
            ts,
        });
    }
}
