use anyhow::{Result, anyhow};
use chrono::{TimeDelta, Utc};
use futures::future::BoxFuture;
use qan_agent::qan::iter::IntervalIter;
use qan_agent::qan::{Interval, IntervalSource};
use qan_agent::ticker::Tick;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Skips the first tick and fails on the third.
#[derive(Default)]
struct CountingSource {
    ticks: u64,
}

impl IntervalSource for CountingSource {
    fn tick(&mut self, now: Tick) -> BoxFuture<'_, Result<Option<Interval>>> {
        Box::pin(async move {
            self.ticks += 1;
            match self.ticks {
                1 => Ok(None),
                3 => Err(anyhow!("cannot stat slow log")),
                n => Ok(Some(Interval {
                    number: n,
                    start_time: now - TimeDelta::seconds(60),
                    stop_time: now,
                    ..Interval::default()
                })),
            }
        })
    }
}

#[tokio::test]
async fn test_intervals_follow_ticks() {
    let (tick_tx, tick_rx) = mpsc::channel(1);
    let (mut iter, mut intervals) =
        IntervalIter::spawn("db1:3306", Box::new(CountingSource::default()), tick_rx);

    for _ in 0..4 {
        tick_tx.send(Utc::now()).await.unwrap();
    }

    let first = timeout(Duration::from_secs(1), intervals.recv()).await.unwrap().unwrap();
    assert_eq!(first.number, 2);

    // The failed third tick is skipped.
    let second = timeout(Duration::from_secs(1), intervals.recv()).await.unwrap().unwrap();
    assert_eq!(second.number, 4);

    iter.stop().await;
}

#[tokio::test]
async fn test_stop_twice() {
    let (_tick_tx, tick_rx) = mpsc::channel(1);
    let (mut iter, mut intervals) =
        IntervalIter::spawn("db1:3306", Box::new(CountingSource::default()), tick_rx);

    iter.stop().await;
    iter.stop().await;

    assert!(intervals.recv().await.is_none());
}

#[tokio::test]
async fn test_exits_when_ticks_close() {
    let (tick_tx, tick_rx) = mpsc::channel(1);
    let (mut iter, mut intervals) =
        IntervalIter::spawn("db1:3306", Box::new(CountingSource::default()), tick_rx);

    drop(tick_tx);

    assert!(timeout(Duration::from_secs(1), intervals.recv()).await.unwrap().is_none());
    iter.stop().await;
}
