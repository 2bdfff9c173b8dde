use super::config::QanConfig;
use super::iter::IntervalIter;
use super::report::Report;
use super::spool::Spooler;
use super::status::StatusBoard;
use super::{Interval, IntervalSource, QanResult, StopHandle, Worker};
use crate::agent::metrics::AgentMetrics;
use crate::ticker::{ClockHandle, Tick};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Time a worker gets past its run budget to hand back a partial result.
const RUN_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Drives the setup, run and cleanup cycle of one worker for one MySQL instance.
pub struct Analyzer {
    name: String,
    config: QanConfig,
    source: Box<dyn IntervalSource>,
    worker: Box<dyn Worker>,
    spooler: Arc<dyn Spooler>,
    status: StatusBoard,
    metrics: Option<AgentMetrics>,
    restart: Option<mpsc::Receiver<()>>,
}

/// Running analyzer.
pub struct AnalyzerHandle {
    name: String,
    clock: ClockHandle,
    ticks: mpsc::Sender<Tick>,
    worker_stop: StopHandle,
    status: StatusBoard,
    iter: IntervalIter,
    stop: Option<oneshot::Sender<oneshot::Sender<()>>>,
    task: Option<JoinHandle<()>>,
}

impl Analyzer {
    #[must_use]
    pub fn new(
        name: &str,
        config: QanConfig,
        source: Box<dyn IntervalSource>,
        worker: Box<dyn Worker>,
        spooler: Arc<dyn Spooler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            source,
            worker,
            spooler,
            status: StatusBoard::new(),
            metrics: None,
            restart: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusBoard) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reset the worker every time `restart` receives a notification.
    #[must_use]
    pub fn with_restart(mut self, restart: mpsc::Receiver<()>) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Subscribe to `clock` at the configured interval and start processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the clock is not running.
    pub async fn start(self, clock: &ClockHandle) -> Result<AnalyzerHandle> {
        self.config.validate()?;

        let Self {
            name,
            config,
            source,
            worker,
            spooler,
            status,
            metrics,
            restart,
        } = self;

        let (ticks, tick_rx) = mpsc::channel(1);
        let (mut iter, intervals) = IntervalIter::spawn(&name, source, tick_rx);

        if let Err(e) = clock.add(ticks.clone(), config.interval(), true).await {
            iter.stop().await;
            return Err(e);
        }

        let worker_stop = worker.stop_handle();
        let (stop, stop_rx) = oneshot::channel();
        status.update(&name, "Idle");
        info!(instance = %name, collect_from = %config.collect_from, interval = config.interval, "analyzer started");

        let cycle = Cycle {
            name: name.clone(),
            config,
            worker,
            spooler,
            status: status.clone(),
            metrics,
        };
        let task = tokio::spawn(run(cycle, intervals, restart, stop_rx));

        Ok(AnalyzerHandle {
            name,
            clock: clock.clone(),
            ticks,
            worker_stop,
            status,
            iter,
            stop: Some(stop),
            task: Some(task),
        })
    }
}

impl AnalyzerHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Seconds until the next tick, if subscribed.
    pub async fn next_tick_in(&self) -> Option<f64> {
        self.clock.eta(&self.ticks).await
    }

    /// Stop the worker, the iterator and the analyzer loop. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.clock.remove(&self.ticks).await;
        // Ends a run in progress at its next event.
        self.worker_stop.stop();

        if let Some(stop) = self.stop.take() {
            let (ack, done) = oneshot::channel();
            if stop.send(ack).is_ok() {
                let _ = done.await;
            }
        }
        if let Err(e) = task.await {
            warn!(instance = %self.name, error = %e, "analyzer task failed");
        }

        self.iter.stop().await;
        self.status.remove(&self.name);
        info!(instance = %self.name, "analyzer stopped");
    }
}

struct Cycle {
    name: String,
    config: QanConfig,
    worker: Box<dyn Worker>,
    spooler: Arc<dyn Spooler>,
    status: StatusBoard,
    metrics: Option<AgentMetrics>,
}

impl Cycle {
    async fn process(&mut self, mut interval: Interval) {
        let number = interval.number;
        let timer = self.metrics.as_ref().map(|m| m.start_cycle(&self.name));

        self.status
            .update(&self.name, format!("Setup interval {number}"));
        if let Err(e) = self.worker.setup(&mut interval).await {
            warn!(instance = %self.name, interval = number, error = %e, "setup failed, skipping interval");
            self.status
                .update(&self.name, format!("Setup failed for interval {number}: {e}"));
            if let Some(timer) = timer {
                timer.error();
            }
            return;
        }

        self.status
            .update(&self.name, format!("Running interval {number}"));
        let started = Instant::now();
        let limit = self.config.worker_run_time() + RUN_TIMEOUT_GRACE;
        let result = match timeout(limit, self.worker.run()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(instance = %self.name, interval = number, error = %e, "worker run failed");
                Some(QanResult::from_error(e.to_string()))
            }
            Err(_) => {
                error!(instance = %self.name, interval = number, "worker run timed out");
                Some(QanResult::from_error(format!(
                    "worker run timed out after {}s",
                    limit.as_secs()
                )))
            }
        };

        let failed = result.as_ref().is_some_and(|r| r.error.is_some());
        match result {
            Some(mut result) => {
                if result.run_time.is_zero() {
                    result.run_time = started.elapsed();
                }
                let report = Report::new(&self.name, &interval, result, self.config.report_limit);
                if let Some(metrics) = &self.metrics {
                    metrics.record_classes(&self.name, report.class.len());
                }
                debug!(instance = %self.name, interval = number, classes = report.class.len(), "spooling report");
                if let Err(e) = self.spooler.write(report) {
                    warn!(instance = %self.name, interval = number, error = %e, "cannot spool report");
                }
            }
            None => debug!(instance = %self.name, interval = number, "no data"),
        }

        if let Err(e) = self.worker.cleanup().await {
            warn!(instance = %self.name, interval = number, error = %e, "cleanup failed");
        }

        self.status.merge(&self.worker.status());
        self.status.update(
            &self.name,
            format!("Idle, last interval {number} at {}", Utc::now().to_rfc3339()),
        );

        if let Some(timer) = timer {
            if failed {
                timer.error();
            } else {
                timer.success();
            }
        }
    }

    fn restarted(&mut self) {
        info!(instance = %self.name, "MySQL restarted, resetting worker");
        self.worker.reset();
        if let Some(metrics) = &self.metrics {
            metrics.record_restart(&self.name);
        }
        self.status
            .update(&self.name, format!("MySQL restarted at {}", Utc::now().to_rfc3339()));
    }
}

/// Resolves on the next restart notification, never if there is no channel.
async fn next_restart(restart: &mut Option<mpsc::Receiver<()>>) {
    loop {
        if let Some(rx) = restart.as_mut() {
            if rx.recv().await.is_some() {
                return;
            }
            *restart = None;
        } else {
            std::future::pending::<()>().await;
        }
    }
}

async fn run(
    mut cycle: Cycle,
    mut intervals: mpsc::Receiver<Interval>,
    mut restart: Option<mpsc::Receiver<()>>,
    mut stop: oneshot::Receiver<oneshot::Sender<()>>,
) {
    loop {
        tokio::select! {
            biased;

            ack = &mut stop => {
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }

            () = next_restart(&mut restart) => cycle.restarted(),

            interval = intervals.recv() => {
                let Some(interval) = interval else {
                    break;
                };
                cycle.process(interval).await;
            }
        }
    }

    debug!(instance = %cycle.name, "analyzer loop exited");
}
