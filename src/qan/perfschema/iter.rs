use crate::qan::{Interval, IntervalSource};
use crate::ticker::Tick;
use anyhow::Result;
use futures::future::BoxFuture;

/// Every tick closes an interval that started at the previous tick.
#[derive(Debug, Default)]
pub struct PerfSchemaIntervals {
    number: u64,
    last: Option<Tick>,
}

impl PerfSchemaIntervals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IntervalSource for PerfSchemaIntervals {
    fn tick(&mut self, now: Tick) -> BoxFuture<'_, Result<Option<Interval>>> {
        Box::pin(async move {
            let start_time = self.last.replace(now).unwrap_or(now);
            self.number += 1;

            Ok(Some(Interval {
                number: self.number,
                start_time,
                stop_time: now,
                ..Interval::default()
            }))
        })
    }
}
