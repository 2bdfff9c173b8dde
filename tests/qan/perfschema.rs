use super::super::common::{ScriptedDigestSource, digest_row};
use chrono::{DateTime, TimeDelta, Utc};
use qan_agent::qan::perfschema::{OVERFLOW_CLASS_ID, OVERFLOW_FINGERPRINT, PerfSchemaWorker};
use qan_agent::qan::{Interval, QanResult, Worker};
use qan_agent::qan::perfschema::DigestRow;

const DIGEST_A: &str = "0000000000000000aaaaaaaaaaaaaaaa";
const DIGEST_B: &str = "0000000000000000bbbbbbbbbbbbbbbb";
const ID_A: &str = "AAAAAAAAAAAAAAAA";
const ID_B: &str = "BBBBBBBBBBBBBBBB";

fn interval(number: u64) -> Interval {
    let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
    let offset = i64::try_from(number).unwrap();
    Interval {
        number,
        start_time: base + TimeDelta::seconds(60 * offset),
        stop_time: base + TimeDelta::seconds(60 * (offset + 1)),
        ..Interval::default()
    }
}

async fn cycle(worker: &mut PerfSchemaWorker, number: u64) -> Option<QanResult> {
    let mut interval = interval(number);
    worker.setup(&mut interval).await.unwrap();
    let result = worker.run().await.unwrap();
    worker.cleanup().await.unwrap();
    result
}

fn snapshot(a: u64, b: u64) -> Vec<DigestRow> {
    vec![
        digest_row(DIGEST_A, "shop", a, a * 2_000_000_000),
        digest_row(DIGEST_B, "shop", b, b * 500_000_000),
    ]
}

fn class_count(result: &QanResult, id: &str) -> Option<u64> {
    result
        .class
        .iter()
        .find(|c| c.id == id)
        .map(|c| c.total_queries)
}

#[tokio::test]
async fn test_first_run_reports_nothing() {
    let source = ScriptedDigestSource::new(vec![snapshot(10, 5)]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source.clone()));

    assert!(cycle(&mut worker, 1).await.is_none());
    assert_eq!(source.reads(), 1);
}

#[tokio::test]
#[allow(clippy::float_cmp)]
async fn test_four_intervals_end_to_end() {
    let source = ScriptedDigestSource::new(vec![
        snapshot(10, 5),
        snapshot(20, 8),
        snapshot(30, 12),
        // A did not run during interval 4.
        snapshot(30, 20),
    ]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source.clone()));

    assert!(cycle(&mut worker, 1).await.is_none());

    let second = cycle(&mut worker, 2).await.unwrap();
    assert_eq!(class_count(&second, ID_A), Some(10));
    assert_eq!(class_count(&second, ID_B), Some(3));

    let third = cycle(&mut worker, 3).await.unwrap();
    assert_eq!(class_count(&third, ID_A), Some(10));
    assert_eq!(class_count(&third, ID_B), Some(4));

    let fourth = cycle(&mut worker, 4).await.unwrap();
    assert_eq!(fourth.class.len(), 1);
    assert_eq!(class_count(&fourth, ID_A), None);
    assert_eq!(class_count(&fourth, ID_B), Some(8));

    let b = &fourth.class[0];
    assert_eq!(b.fingerprint, format!("SELECT {DIGEST_B}"));
    let query_time = b.metrics.time_metrics.get("Query_time").unwrap();
    assert_eq!(query_time.sum, 8.0 * 500_000_000.0 * 1e-12);

    let global = fourth.global.unwrap();
    assert_eq!(global.total_queries, 8);

    // Digest text is fetched once per class and reused afterwards.
    assert_eq!(source.text_lookups(), 2);
}

#[tokio::test]
async fn test_gap_resets_baseline() {
    let source = ScriptedDigestSource::new(vec![
        snapshot(10, 5),
        snapshot(20, 8),
        snapshot(30, 12),
        snapshot(40, 16),
    ]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source));

    assert!(cycle(&mut worker, 1).await.is_none());
    assert!(cycle(&mut worker, 2).await.is_some());

    // Interval 3 was lost, so interval 4 is a first run again.
    assert!(cycle(&mut worker, 4).await.is_none());

    let fifth = cycle(&mut worker, 5).await.unwrap();
    assert_eq!(class_count(&fifth, ID_A), Some(10));
}

#[tokio::test]
async fn test_earlier_start_time_resets_baseline() {
    let source = ScriptedDigestSource::new(vec![snapshot(10, 5), snapshot(20, 8), snapshot(30, 12)]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source));

    assert!(cycle(&mut worker, 1).await.is_none());

    let mut interval = interval(2);
    interval.start_time -= TimeDelta::seconds(3600);
    worker.setup(&mut interval).await.unwrap();
    assert!(worker.run().await.unwrap().is_none());
}

#[tokio::test]
async fn test_reset_forgets_baseline() {
    let source = ScriptedDigestSource::new(vec![snapshot(10, 5), snapshot(20, 8), snapshot(30, 12)]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source));

    assert!(cycle(&mut worker, 1).await.is_none());
    worker.reset();
    assert!(cycle(&mut worker, 2).await.is_none());
    assert!(cycle(&mut worker, 3).await.is_some());
}

#[tokio::test]
async fn test_overflow_digest_uses_placeholder() {
    let overflow = |count: u64| DigestRow {
        schema_name: None,
        digest: None,
        count_star: count,
        sum_timer_wait: count * 1_000_000,
        ..DigestRow::default()
    };
    let source = ScriptedDigestSource::new(vec![vec![overflow(100)], vec![overflow(150)]]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source));

    assert!(cycle(&mut worker, 1).await.is_none());
    let result = cycle(&mut worker, 2).await.unwrap();

    assert_eq!(result.class.len(), 1);
    assert_eq!(result.class[0].id, OVERFLOW_CLASS_ID);
    assert_eq!(result.class[0].fingerprint, OVERFLOW_FINGERPRINT);
    assert_eq!(result.class[0].total_queries, 50);
}

#[tokio::test]
async fn test_connect_failure_reports_nothing_and_keeps_baseline() {
    let source = ScriptedDigestSource::new(vec![snapshot(10, 5), snapshot(20, 8)]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source.clone()));

    assert!(cycle(&mut worker, 1).await.is_none());

    source.set_connect_failing(true);
    assert!(cycle(&mut worker, 2).await.is_none());
    assert_eq!(source.reads(), 1);

    source.set_connect_failing(false);
    let third = cycle(&mut worker, 3).await.unwrap();
    assert_eq!(class_count(&third, ID_A), Some(10));
    assert_eq!(class_count(&third, ID_B), Some(3));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let source = ScriptedDigestSource::new(vec![snapshot(10, 5), snapshot(20, 8)]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source.clone()));

    let stop = worker.stop_handle();
    stop.stop();
    stop.stop();

    assert!(cycle(&mut worker, 1).await.is_none());
    assert_eq!(source.reads(), 0);
}

#[tokio::test]
async fn test_status_reports_rows() {
    let source = ScriptedDigestSource::new(vec![snapshot(10, 5)]);
    let mut worker = PerfSchemaWorker::new("db1:3306", Box::new(source));

    assert!(cycle(&mut worker, 1).await.is_none());

    let status = worker.status();
    assert!(status.contains_key("db1:3306-worker"));
}
