use super::super::common::{MemorySpooler, ScriptedDigestSource, digest_row};
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::Registry;
use qan_agent::agent::metrics::AgentMetrics;
use qan_agent::qan::analyzer::Analyzer;
use qan_agent::qan::config::{CollectFrom, QanConfig};
use qan_agent::qan::perfschema::{DigestRow, DigestSource, PerfSchemaIntervals, PerfSchemaWorker};
use qan_agent::qan::report::Report;
use qan_agent::qan::status::StatusBoard;
use qan_agent::qan::{Interval, QanResult, StopHandle, Worker};
use qan_agent::ticker::Clock;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const NAME: &str = "db1:3306";
const DIGEST: &str = "0000000000000000aaaaaaaaaaaaaaaa";

fn config() -> QanConfig {
    QanConfig {
        collect_from: CollectFrom::PerfSchema,
        interval: 1,
        ..QanConfig::new()
    }
}

/// Counters that grow by 10 executions on every read.
fn growing_source() -> ScriptedDigestSource {
    ScriptedDigestSource::new(
        (1..=50)
            .map(|i| vec![digest_row(DIGEST, "shop", i * 10, i * 10_000_000_000)])
            .collect(),
    )
}

fn analyzer(source: Box<dyn DigestSource>, spooler: std::sync::Arc<MemorySpooler>) -> Analyzer {
    Analyzer::new(
        NAME,
        config(),
        Box::new(PerfSchemaIntervals::new()),
        Box::new(PerfSchemaWorker::new(NAME, source)),
        spooler,
    )
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<Report>) -> Report {
    timeout(Duration::from_secs(10), reports.recv())
        .await
        .expect("no report in time")
        .expect("spooler closed")
}

#[tokio::test(start_paused = true)]
async fn test_reports_from_second_interval() {
    let mut clock = Clock::spawn();
    let (spooler, mut reports) = MemorySpooler::new();
    let status = StatusBoard::new();
    let registry = Registry::new();
    let metrics = AgentMetrics::new();
    metrics.register(&registry).unwrap();

    let mut handle = analyzer(Box::new(growing_source()), spooler)
        .with_status(status.clone())
        .with_metrics(metrics)
        .start(&clock.handle())
        .await
        .unwrap();
    assert_eq!(handle.name(), NAME);

    let first = next_report(&mut reports).await;
    assert_eq!(first.instance, NAME);
    assert_eq!(first.interval, 2);
    assert!(first.error.is_none());
    assert_eq!(first.class.len(), 1);
    assert_eq!(first.class[0].total_queries, 10);
    assert!(first.end_ts >= first.start_ts);

    let second = next_report(&mut reports).await;
    assert_eq!(second.interval, 3);

    assert!(status.get(NAME).is_some());
    assert!(status.get(&format!("{NAME}-worker")).is_some());

    let intervals = registry
        .gather()
        .into_iter()
        .find(|m| m.name() == "qan_agent_intervals_total")
        .unwrap();
    assert!(intervals.get_metric()[0].get_counter().value() >= 2.0);

    handle.stop().await;
    handle.stop().await;
    assert!(status.get(NAME).is_none());
    assert!(status.get(&format!("{NAME}-worker")).is_none());

    clock.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_resets_baseline() {
    let mut clock = Clock::spawn();
    let (spooler, mut reports) = MemorySpooler::new();
    let (restart_tx, restart_rx) = mpsc::channel(1);

    let mut handle = analyzer(Box::new(growing_source()), spooler)
        .with_restart(restart_rx)
        .start(&clock.handle())
        .await
        .unwrap();

    let before = next_report(&mut reports).await;
    restart_tx.send(()).await.unwrap();

    // The interval after the restart only takes a new baseline.
    let after = next_report(&mut reports).await;
    assert_eq!(after.interval, before.interval + 2);

    handle.stop().await;
    clock.stop().await;
}

struct FailingSource;

impl DigestSource for FailingSource {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>>> {
        Box::pin(async { Err(anyhow!("events_statements_summary_by_digest doesn't exist")) })
    }

    fn digest_text<'a>(&'a self, _digest: Option<&'a str>) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async { Ok(None) })
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_error_is_reported_and_loop_continues() {
    let mut clock = Clock::spawn();
    let (spooler, mut reports) = MemorySpooler::new();

    let mut handle = analyzer(Box::new(FailingSource), spooler)
        .start(&clock.handle())
        .await
        .unwrap();

    let first = next_report(&mut reports).await;
    let error = first.error.unwrap();
    assert!(error.contains("doesn't exist"), "{error}");
    assert!(first.global.is_none());

    let second = next_report(&mut reports).await;
    assert_eq!(second.interval, first.interval + 1);
    assert!(second.error.is_some());

    handle.stop().await;
    clock.stop().await;
}

/// Worker that runs slightly past its budget, then hands back a partial result.
struct OverBudgetWorker {
    budget: Duration,
    stop: StopHandle,
}

impl Worker for OverBudgetWorker {
    fn name(&self) -> &str {
        NAME
    }

    fn setup<'a>(&'a mut self, _interval: &'a mut Interval) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn run(&mut self) -> BoxFuture<'_, Result<Option<QanResult>>> {
        Box::pin(async move {
            tokio::time::sleep(self.budget + Duration::from_millis(200)).await;
            Ok(Some(QanResult {
                stop_offset: 4096,
                error: Some("timeout parsing slow.log after 1.0s".to_string()),
                ..QanResult::default()
            }))
        })
    }

    fn cleanup(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn reset(&mut self) {}

    fn status(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[tokio::test(start_paused = true)]
async fn test_partial_result_survives_budget_equal_to_interval() {
    let mut clock = Clock::spawn();
    let (spooler, mut reports) = MemorySpooler::new();
    let config = QanConfig {
        worker_run_time: 1,
        ..config()
    };
    let worker = OverBudgetWorker {
        budget: config.worker_run_time(),
        stop: StopHandle::new(),
    };

    let mut handle = Analyzer::new(
        NAME,
        config,
        Box::new(PerfSchemaIntervals::new()),
        Box::new(worker),
        spooler,
    )
    .start(&clock.handle())
    .await
    .unwrap();

    let report = next_report(&mut reports).await;
    assert_eq!(report.stop_offset, 4096);
    let error = report.error.unwrap();
    assert!(error.starts_with("timeout parsing"), "{error}");

    handle.stop().await;
    clock.stop().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut clock = Clock::spawn();
    let (spooler, _reports) = MemorySpooler::new();

    let result = Analyzer::new(
        NAME,
        QanConfig {
            interval: 0,
            ..config()
        },
        Box::new(PerfSchemaIntervals::new()),
        Box::new(PerfSchemaWorker::new(NAME, Box::new(growing_source()))),
        spooler,
    )
    .start(&clock.handle())
    .await;
    assert!(result.is_err());

    clock.stop().await;
}

#[tokio::test]
async fn test_start_fails_on_stopped_clock() {
    let mut clock = Clock::spawn();
    let handle = clock.handle();
    clock.stop().await;

    let (spooler, _reports) = MemorySpooler::new();
    assert!(analyzer(Box::new(growing_source()), spooler).start(&handle).await.is_err());
}
