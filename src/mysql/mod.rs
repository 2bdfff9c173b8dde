//! MySQL capability set consumed by the QAN workers and the restart monitor:
//! - `Connector` trait (connect/close, SQL handle, global variables, uptime, version, UTC offset).
//! - `MySqlConnector`, the sqlx-backed implementation.
//! - Version normalization and slow log path resolution helpers.

mod restart;

pub use restart::{RestartMonitor, RestartMonitorHandle, is_restart};

use anyhow::{Context, Result, anyhow};
use arc_swap::ArcSwapOption;
use chrono::TimeDelta;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, instrument};
use tracing_futures::Instrument as _;
use url::Url;

/// What the QAN core needs from a MySQL connection.
pub trait Connector: Send + Sync {
    /// Open the connection (idempotent).
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    fn close(&self) -> BoxFuture<'_, ()>;

    /// SQL execution handle.
    ///
    /// # Errors
    ///
    /// Returns an error if `connect` has not succeeded.
    fn pool(&self) -> Result<MySqlPool>;

    /// Execute statements in order, stopping at the first failure.
    fn exec<'a>(&'a self, statements: &'a [String]) -> BoxFuture<'a, Result<()>>;

    fn global_var_string<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String>>;

    fn global_var_number<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<f64>>;

    /// Server uptime in seconds.
    fn uptime(&self) -> BoxFuture<'_, Result<u64>>;

    /// Whether the server version is at least `min` (e.g. `"5.6.5"`).
    fn at_least_version<'a>(&'a self, min: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let version = self.global_var_string("version").await?;
            Ok(normalize_version(&version).1 >= normalize_version(min).1)
        })
    }

    /// Offset of the server's local time from UTC.
    fn utc_offset(&self) -> BoxFuture<'_, Result<TimeDelta>>;
}

/// Connector backed by a small sqlx pool, opened on `connect` and dropped on `close`.
pub struct MySqlConnector {
    opts: MySqlConnectOptions,
    pool: ArcSwapOption<MySqlPool>,
}

impl MySqlConnector {
    /// # Errors
    ///
    /// Returns an error if the DSN cannot be parsed.
    pub fn new(dsn: &SecretString) -> Result<Self> {
        let opts = MySqlConnectOptions::from_str(dsn.expose_secret())
            .context("invalid MySQL DSN")?;
        Ok(Self {
            opts,
            pool: ArcSwapOption::empty(),
        })
    }

    /// A new, unconnected connector to the same server.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            opts: self.opts.clone(),
            pool: ArcSwapOption::empty(),
        }
    }
}

impl Connector for MySqlConnector {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.pool.load().is_some() {
                return Ok(());
            }

            let pool = MySqlPoolOptions::new()
                .max_connections(2)
                .min_connections(0)
                .acquire_timeout(Duration::from_secs(5))
                .connect_with(self.opts.clone())
                .await
                .context("failed to connect to MySQL")?;

            self.pool.store(Some(Arc::new(pool)));
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(pool) = self.pool.swap(None) {
                pool.close().await;
            }
        })
    }

    fn pool(&self) -> Result<MySqlPool> {
        self.pool
            .load_full()
            .map(|pool| (*pool).clone())
            .ok_or_else(|| anyhow!("not connected to MySQL"))
    }

    #[instrument(skip(self), level = "debug", err, fields(db.system = "mysql", otel.kind = "client"))]
    fn exec<'a>(&'a self, statements: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let pool = self.pool()?;
            for statement in statements {
                let span = info_span!(
                    "db.query",
                    db.system = "mysql",
                    db.operation = "SET",
                    db.statement = %statement,
                    otel.kind = "client"
                );
                sqlx::raw_sql(statement)
                    .execute(&pool)
                    .instrument(span)
                    .await
                    .with_context(|| format!("failed to execute '{statement}'"))?;
                debug!(statement = %statement, "executed");
            }
            Ok(())
        })
    }

    fn global_var_string<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if !VARIABLE_NAME.is_match(name) {
                return Err(anyhow!("invalid variable name: {name}"));
            }
            let pool = self.pool()?;
            let statement = format!("SELECT CAST(@@GLOBAL.{name} AS CHAR)");
            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "SELECT",
                db.statement = %statement,
                otel.kind = "client"
            );
            let value = sqlx::query_scalar::<_, Option<String>>(&statement)
                .fetch_one(&pool)
                .instrument(span)
                .await
                .with_context(|| format!("failed to read @@GLOBAL.{name}"))?;
            Ok(value.unwrap_or_default())
        })
    }

    fn global_var_number<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            let value = self.global_var_string(name).await?;
            parse_variable_number(&value)
                .ok_or_else(|| anyhow!("@@GLOBAL.{name} is not a number: {value}"))
        })
    }

    fn uptime(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let pool = self.pool()?;
            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "SHOW",
                db.statement = "SHOW GLOBAL STATUS LIKE 'Uptime'",
                otel.kind = "client"
            );
            let (_, value) =
                sqlx::query_as::<_, (String, String)>("SHOW GLOBAL STATUS LIKE 'Uptime'")
                    .fetch_one(&pool)
                    .instrument(span)
                    .await
                    .context("failed to read Uptime")?;
            value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid Uptime value: {value}"))
        })
    }

    fn utc_offset(&self) -> BoxFuture<'_, Result<TimeDelta>> {
        Box::pin(async move {
            let pool = self.pool()?;
            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "SELECT",
                db.statement = "SELECT TIMESTAMPDIFF(SECOND, UTC_TIMESTAMP(), NOW())",
                otel.kind = "client"
            );
            let secs = sqlx::query_scalar::<_, i64>(
                "SELECT TIMESTAMPDIFF(SECOND, UTC_TIMESTAMP(), NOW())",
            )
            .fetch_one(&pool)
            .instrument(span)
            .await
            .context("failed to read MySQL UTC offset")?;
            Ok(TimeDelta::seconds(secs))
        })
    }
}

static VARIABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\A[A-Za-z_][A-Za-z0-9_]*\z").expect("valid variable name regex")
});

fn parse_variable_number(value: &str) -> Option<f64> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("ON") => Some(1.0),
        v if v.eq_ignore_ascii_case("OFF") => Some(0.0),
        v => v.parse::<f64>().ok(),
    }
}

/// Parse and normalize a server version string.
/// Returns a tuple of (`normalized_string`, `version_number`).
/// e.g. "10.5.8-MariaDB" -> ("10.5.8", 100508)
///      "5.6" -> ("5.6.0", 50600)
#[must_use]
pub fn normalize_version(version_string: &str) -> (String, i64) {
    static RE: Lazy<Regex> = Lazy::new(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("Invalid regex")
    });

    if let Some(caps) = RE.captures(version_string.trim()) {
        let part = |i: usize| {
            caps.get(i)
                .map_or(0, |m| m.as_str().parse::<i64>().unwrap_or(0))
        };
        let (major, minor, patch) = (part(1), part(2), part(3));
        (
            format!("{major}.{minor}.{patch}"),
            major * 10000 + minor * 100 + patch,
        )
    } else {
        ("0.0.0".to_string(), 0)
    }
}

/// Instance name derived from a DSN: `host:port`, or the socket path.
#[must_use]
pub fn instance_name(dsn: &SecretString) -> String {
    let Ok(url) = Url::parse(dsn.expose_secret()) else {
        return "mysql".to_string();
    };

    if let Some((_, socket)) = url.query_pairs().find(|(k, _)| k == "socket") {
        return socket.into_owned();
    }

    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(3306);
    format!("{host}:{port}")
}

/// Resolve the current slow log path, relative names are under `@@datadir`.
///
/// # Errors
///
/// Returns an error if the variables cannot be read or the slow log is unset.
pub async fn slow_log_file(conn: &dyn Connector) -> Result<PathBuf> {
    let file = conn.global_var_string("slow_query_log_file").await?;
    if file.is_empty() {
        return Err(anyhow!("slow_query_log_file is not set"));
    }

    let path = Path::new(&file);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let datadir = conn.global_var_string("datadir").await?;
    Ok(Path::new(&datadir).join(path))
}
