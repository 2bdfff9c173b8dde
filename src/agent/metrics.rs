use anyhow::Result;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

/// Agent self-metrics, labelled by MySQL instance.
#[derive(Clone)]
pub struct AgentMetrics {
    cycle_duration_seconds: HistogramVec,
    cycle_errors_total: CounterVec,
    intervals_total: CounterVec,
    classes: GaugeVec,
    restarts_total: CounterVec,
    last_cycle_timestamp: GaugeVec,
    last_cycle_success: GaugeVec,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    #[must_use]
    #[allow(clippy::expect_used)]
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails.
    pub fn new() -> Self {
        let cycle_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "qan_agent_cycle_duration_seconds",
                "Time spent in one setup/run/cleanup cycle in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["instance"],
        )
        .expect("qan_agent_cycle_duration_seconds");

        let cycle_errors_total = CounterVec::new(
            Opts::new(
                "qan_agent_cycle_errors_total",
                "Total number of cycles that ended with an error",
            ),
            &["instance"],
        )
        .expect("qan_agent_cycle_errors_total");

        let intervals_total = CounterVec::new(
            Opts::new(
                "qan_agent_intervals_total",
                "Total number of intervals processed",
            ),
            &["instance"],
        )
        .expect("qan_agent_intervals_total");

        let classes = GaugeVec::new(
            Opts::new(
                "qan_agent_classes",
                "Number of query classes in the last report",
            ),
            &["instance"],
        )
        .expect("qan_agent_classes");

        let restarts_total = CounterVec::new(
            Opts::new(
                "qan_agent_mysql_restarts_total",
                "Total number of MySQL restarts observed",
            ),
            &["instance"],
        )
        .expect("qan_agent_mysql_restarts_total");

        let last_cycle_timestamp = GaugeVec::new(
            Opts::new(
                "qan_agent_last_cycle_timestamp_seconds",
                "Unix timestamp of the last cycle",
            ),
            &["instance"],
        )
        .expect("qan_agent_last_cycle_timestamp_seconds");

        let last_cycle_success = GaugeVec::new(
            Opts::new(
                "qan_agent_last_cycle_success",
                "Whether the last cycle was successful (1=success, 0=failure)",
            ),
            &["instance"],
        )
        .expect("qan_agent_last_cycle_success");

        Self {
            cycle_duration_seconds,
            cycle_errors_total,
            intervals_total,
            classes,
            restarts_total,
            last_cycle_timestamp,
            last_cycle_success,
        }
    }

    #[must_use]
    pub fn start_cycle(&self, instance: &str) -> CycleTimer {
        self.intervals_total.with_label_values(&[instance]).inc();
        CycleTimer {
            instance: instance.to_string(),
            start: Instant::now(),
            metrics: self.clone(),
            done: false,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_classes(&self, instance: &str, classes: usize) {
        self.classes
            .with_label_values(&[instance])
            .set(classes as f64);
    }

    pub fn record_restart(&self, instance: &str) {
        self.restarts_total.with_label_values(&[instance]).inc();
    }

    fn record(&self, instance: &str, duration: f64, success: bool) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        self.cycle_duration_seconds
            .with_label_values(&[instance])
            .observe(duration);
        self.last_cycle_timestamp
            .with_label_values(&[instance])
            .set(timestamp);
        self.last_cycle_success
            .with_label_values(&[instance])
            .set(if success { 1.0 } else { 0.0 });

        if !success {
            self.cycle_errors_total.with_label_values(&[instance]).inc();
        }
    }

    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.cycle_duration_seconds.clone()))?;
        registry.register(Box::new(self.cycle_errors_total.clone()))?;
        registry.register(Box::new(self.intervals_total.clone()))?;
        registry.register(Box::new(self.classes.clone()))?;
        registry.register(Box::new(self.restarts_total.clone()))?;
        registry.register(Box::new(self.last_cycle_timestamp.clone()))?;
        registry.register(Box::new(self.last_cycle_success.clone()))?;
        Ok(())
    }
}

/// Times one analyzer cycle; counts as a success unless `error` is called.
pub struct CycleTimer {
    instance: String,
    start: Instant,
    metrics: AgentMetrics,
    done: bool,
}

impl CycleTimer {
    pub fn success(mut self) {
        self.finish(true);
    }

    pub fn error(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        if self.done {
            return;
        }
        self.done = true;
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics.record(&self.instance, duration, success);
    }
}

impl Drop for CycleTimer {
    fn drop(&mut self) {
        self.finish(true);
    }
}
