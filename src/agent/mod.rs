//! Process wiring: one analyzer per DSN sharing a clock, a restart monitor,
//! a spooler and the HTTP status server.

pub mod metrics;
pub mod status;

use crate::mysql::{self, Connector, MySqlConnector, RestartMonitor, RestartMonitorHandle};
use crate::qan::analyzer::{Analyzer, AnalyzerHandle};
use crate::qan::config::{CollectFrom, QanConfig};
use crate::qan::perfschema::{MySqlDigestSource, PerfSchemaIntervals, PerfSchemaWorker};
use crate::qan::slowlog::{FilenameFn, SlowLogIntervals, SlowLogWorker};
use crate::qan::spool::{FileSpooler, Spooler};
use crate::qan::status::StatusBoard;
use crate::qan::{IntervalSource, Worker};
use crate::ticker::{Clock, ClockHandle};
use anyhow::{Result, anyhow};
use metrics::AgentMetrics;
use prometheus::Registry;
use secrecy::SecretString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Reports waiting to be written before new ones are dropped.
const SPOOL_CAPACITY: usize = 100;

/// Oldest server with `events_statements_summary_by_digest`.
const PERFSCHEMA_MIN_VERSION: &str = "5.6.5";

/// Agent settings shared by every instance.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub qan: QanConfig,
    /// Apply the slow log start statements at startup and the stop ones at exit.
    pub configure_mysql: bool,
    pub spool_dir: PathBuf,
    pub restart_poll_interval: Duration,
}

struct Instance {
    name: String,
    conn: Arc<dyn Connector>,
    analyzer: AnalyzerHandle,
    configured: bool,
}

struct Services {
    clock: ClockHandle,
    monitor: RestartMonitorHandle,
    spooler: Arc<dyn Spooler>,
    status: StatusBoard,
    metrics: AgentMetrics,
}

/// Run the agent until ctrl-c or SIGTERM.
///
/// # Errors
///
/// Returns an error if the options are invalid, the status server cannot
/// bind, or an analyzer cannot be started.
pub async fn new(
    port: u16,
    listen: Option<String>,
    dsn: Vec<SecretString>,
    options: AgentOptions,
) -> Result<()> {
    options.qan.validate()?;
    if dsn.is_empty() {
        return Err(anyhow!("at least one DSN is required"));
    }

    let listener = status::bind(port, listen.as_deref()).await?;

    let registry = Registry::new();
    let metrics = AgentMetrics::new();
    metrics.register(&registry)?;

    let status = StatusBoard::new();
    let spooler = Arc::new(FileSpooler::spawn(&options.spool_dir, SPOOL_CAPACITY)?);
    let mut clock = Clock::spawn();
    let mut monitor = RestartMonitor::spawn(options.restart_poll_interval);

    let services = Services {
        clock: clock.handle(),
        monitor: monitor.handle(),
        spooler: Arc::clone(&spooler) as Arc<dyn Spooler>,
        status: status.clone(),
        metrics,
    };

    let mut instances = Vec::with_capacity(dsn.len());
    let mut started = Ok(());
    for dsn in &dsn {
        match start_instance(dsn, &options, &services).await {
            Ok(instance) => instances.push(instance),
            Err(e) => {
                started = Err(e);
                break;
            }
        }
    }

    let served = match started {
        Ok(()) => {
            info!(
                instances = instances.len(),
                collect_from = %options.qan.collect_from,
                "agent started"
            );
            status::serve(
                listener,
                status::AppState {
                    status: status.clone(),
                    registry,
                },
                shutdown_signal(),
            )
            .await
        }
        Err(e) => Err(e),
    };

    for instance in &mut instances {
        stop_instance(instance, &options.qan, &services.monitor).await;
    }
    monitor.stop().await;
    clock.stop().await;
    spooler.close().await;
    info!("agent stopped");

    served
}

async fn start_instance(
    dsn: &SecretString,
    options: &AgentOptions,
    services: &Services,
) -> Result<Instance> {
    let name = mysql::instance_name(dsn);
    let connector = MySqlConnector::new(dsn)?;
    let monitor_conn: Arc<dyn Connector> = Arc::new(connector.detached());
    let conn: Arc<dyn Connector> = Arc::new(connector);

    let (restart_tx, restart_rx) = mpsc::channel(1);
    services.monitor.add(&name, monitor_conn, restart_tx).await?;

    let qan = options.qan.clone();
    let mut configured = false;

    let (source, worker): (Box<dyn IntervalSource>, Box<dyn Worker>) = match qan.collect_from {
        CollectFrom::SlowLog => {
            if options.configure_mysql {
                configured = configure(conn.as_ref(), &name, &qan.start_statements()).await;
            }
            (
                Box::new(SlowLogIntervals::new(slow_log_filename(Arc::clone(&conn)))),
                Box::new(SlowLogWorker::new(&name, qan.clone(), Arc::clone(&conn))),
            )
        }
        CollectFrom::PerfSchema => {
            check_perfschema(conn.as_ref(), &name).await;
            let source = MySqlDigestSource::new(Arc::clone(&conn));
            (
                Box::new(PerfSchemaIntervals::new()),
                Box::new(PerfSchemaWorker::new(&name, Box::new(source))),
            )
        }
    };

    let analyzer = Analyzer::new(&name, qan, source, worker, Arc::clone(&services.spooler))
        .with_status(services.status.clone())
        .with_metrics(services.metrics.clone())
        .with_restart(restart_rx)
        .start(&services.clock)
        .await;

    match analyzer {
        Ok(analyzer) => Ok(Instance {
            name,
            conn,
            analyzer,
            configured,
        }),
        Err(e) => {
            services.monitor.remove(&name).await;
            conn.close().await;
            Err(e)
        }
    }
}

async fn stop_instance(instance: &mut Instance, qan: &QanConfig, monitor: &RestartMonitorHandle) {
    instance.analyzer.stop().await;
    monitor.remove(&instance.name).await;

    if instance.configured {
        configure(instance.conn.as_ref(), &instance.name, &qan.stop_statements()).await;
    }
    instance.conn.close().await;
}

/// Run `statements`, logging failures. Returns whether they all succeeded.
async fn configure(conn: &dyn Connector, name: &str, statements: &[String]) -> bool {
    let applied = async {
        conn.connect().await?;
        conn.exec(statements).await
    }
    .await;

    match applied {
        Ok(()) => {
            info!(instance = %name, statements = statements.len(), "configured MySQL");
            true
        }
        Err(e) => {
            error!(instance = %name, error = %e, "cannot configure MySQL");
            false
        }
    }
}

/// Warn when `performance_schema` cannot be used; the worker keeps retrying.
async fn check_perfschema(conn: &dyn Connector, name: &str) {
    let checked: Result<()> = async {
        conn.connect().await?;
        if !conn.at_least_version(PERFSCHEMA_MIN_VERSION).await? {
            return Err(anyhow!(
                "MySQL {PERFSCHEMA_MIN_VERSION} or newer is required for performance_schema"
            ));
        }
        if conn.global_var_number("performance_schema").await? < 1.0 {
            return Err(anyhow!("performance_schema is disabled"));
        }
        Ok(())
    }
    .await;

    if let Err(e) = checked {
        warn!(instance = %name, error = %e, "performance_schema not available");
    }
}

fn slow_log_filename(conn: Arc<dyn Connector>) -> FilenameFn {
    Box::new(move || {
        let conn = Arc::clone(&conn);
        Box::pin(async move {
            conn.connect().await?;
            mysql::slow_log_file(conn.as_ref()).await
        })
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
