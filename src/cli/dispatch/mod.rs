use crate::{agent::AgentOptions, cli::actions::Action, qan::config::QanConfig};
use anyhow::{Result, anyhow};
use clap::ArgMatches;
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// # Errors
///
/// Returns an error if required arguments are missing or the QAN settings are invalid
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    // Get the port or return an error
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // Get the listen address (None means auto-detect)
    let listen = matches
        .get_one::<String>("listen")
        .map(std::string::ToString::to_string);

    let dsn: Vec<SecretString> = matches
        .get_many::<String>("dsn")
        .map(|values| values.map(|v| SecretString::from(v.clone())).collect())
        .unwrap_or_default();
    if dsn.is_empty() {
        return Err(anyhow!(
            "DSN is required. Please provide it using the --dsn flag."
        ));
    }

    let qan = qan_config(matches)?;
    qan.validate()?;
    debug!(?qan, "QAN settings");

    let spool_dir = matches
        .get_one::<String>("spool-dir")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("--spool-dir is required"))?;

    let restart_poll_interval = Duration::from_secs(
        matches
            .get_one::<u64>("restart-poll-interval")
            .copied()
            .unwrap_or(1),
    );

    Ok(Action::Run {
        port,
        listen,
        dsn,
        options: AgentOptions {
            qan,
            configure_mysql: matches.get_flag("configure-mysql"),
            spool_dir,
            restart_poll_interval,
        },
    })
}

/// # Errors
///
/// Returns an error if `--collect-from` is not a known source
pub fn qan_config(matches: &ArgMatches) -> Result<QanConfig> {
    let defaults = QanConfig::new();

    let collect_from = match matches.get_one::<String>("collect-from") {
        Some(value) => value.parse()?,
        None => defaults.collect_from,
    };

    Ok(QanConfig {
        collect_from,
        interval: matches
            .get_one::<u64>("interval")
            .copied()
            .unwrap_or(defaults.interval),
        max_slow_log_size: matches
            .get_one::<u64>("max-slow-log-size")
            .copied()
            .unwrap_or(defaults.max_slow_log_size),
        remove_old_slow_logs: matches
            .get_one::<bool>("remove-old-slow-logs")
            .copied()
            .unwrap_or(defaults.remove_old_slow_logs),
        example_queries: matches
            .get_one::<bool>("example-queries")
            .copied()
            .unwrap_or(defaults.example_queries),
        worker_run_time: matches
            .get_one::<u64>("worker-run-time")
            .copied()
            .unwrap_or(defaults.worker_run_time),
        rate_limit: matches
            .get_one::<u32>("rate-limit")
            .copied()
            .unwrap_or(defaults.rate_limit),
        long_query_time: matches
            .get_one::<f64>("long-query-time")
            .copied()
            .unwrap_or(defaults.long_query_time),
        report_limit: matches
            .get_one::<usize>("report-limit")
            .copied()
            .unwrap_or(defaults.report_limit),
        start: Vec::new(),
        stop: Vec::new(),
    })
}
