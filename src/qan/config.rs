use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const MAX_INTERVAL_SECS: u64 = 3600;

/// Where query statistics are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectFrom {
    #[default]
    SlowLog,
    PerfSchema,
}

impl CollectFrom {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SlowLog => "slowlog",
            Self::PerfSchema => "perfschema",
        }
    }
}

impl fmt::Display for CollectFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectFrom {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slowlog" => Ok(Self::SlowLog),
            "perfschema" => Ok(Self::PerfSchema),
            other => Err(anyhow!(
                "invalid collect_from '{other}', expected 'slowlog' or 'perfschema'"
            )),
        }
    }
}

/// Per-instance QAN settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QanConfig {
    pub collect_from: CollectFrom,
    /// Seconds between intervals.
    pub interval: u64,
    /// Rotate the slow log once it reaches this many bytes, 0 disables rotation.
    pub max_slow_log_size: u64,
    pub remove_old_slow_logs: bool,
    pub example_queries: bool,
    /// Seconds a worker may run, 0 means 90% of `interval`.
    pub worker_run_time: u64,
    /// Percona Server `log_slow_rate_limit`, 0 leaves sampling off.
    pub rate_limit: u32,
    pub long_query_time: f64,
    /// Keep the top N classes per report, 0 keeps all.
    pub report_limit: usize,
    /// Statements that start slow logging, empty means derived defaults.
    pub start: Vec<String>,
    /// Statements that stop slow logging, empty means derived defaults.
    pub stop: Vec<String>,
}

impl Default for QanConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl QanConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collect_from: CollectFrom::SlowLog,
            interval: 60,
            max_slow_log_size: 1_073_741_824,
            remove_old_slow_logs: true,
            example_queries: true,
            worker_run_time: 0,
            rate_limit: 0,
            long_query_time: 1.0,
            report_limit: 200,
            start: Vec::new(),
            stop: Vec::new(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the interval or worker run time are out of range.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 || self.interval > MAX_INTERVAL_SECS {
            return Err(anyhow!(
                "interval must be between 1 and {MAX_INTERVAL_SECS} seconds, got {}",
                self.interval
            ));
        }
        if self.worker_run_time > self.interval {
            return Err(anyhow!(
                "worker run time ({}s) must not exceed the interval ({}s)",
                self.worker_run_time,
                self.interval
            ));
        }
        if self.long_query_time < 0.0 {
            return Err(anyhow!("long_query_time must not be negative"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    #[must_use]
    pub fn worker_run_time(&self) -> Duration {
        if self.worker_run_time == 0 {
            self.interval().saturating_mul(9) / 10
        } else {
            Duration::from_secs(self.worker_run_time)
        }
    }

    #[must_use]
    pub fn start_statements(&self) -> Vec<String> {
        if !self.start.is_empty() {
            return self.start.clone();
        }

        let mut statements = vec![
            "SET GLOBAL slow_query_log=OFF".to_string(),
            format!("SET GLOBAL long_query_time={}", self.long_query_time),
        ];
        if self.rate_limit > 0 {
            statements.extend([
                "SET GLOBAL log_slow_rate_type='query'".to_string(),
                format!("SET GLOBAL log_slow_rate_limit={}", self.rate_limit),
                "SET GLOBAL log_slow_verbosity='full'".to_string(),
                "SET GLOBAL slow_query_log_use_global_control='all'".to_string(),
            ]);
        }
        statements.push("SET GLOBAL slow_query_log=ON".to_string());
        statements
    }

    #[must_use]
    pub fn stop_statements(&self) -> Vec<String> {
        if self.stop.is_empty() {
            vec!["SET GLOBAL slow_query_log=OFF".to_string()]
        } else {
            self.stop.clone()
        }
    }
}
