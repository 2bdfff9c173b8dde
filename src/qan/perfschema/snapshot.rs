use crate::mysql::Connector;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info_span, instrument};
use tracing_futures::Instrument as _;

/// Class of the digest table's overflow row (NULL digest).
pub const OVERFLOW_CLASS_ID: &str = "2";

/// Fingerprint used for the overflow class when MySQL has no text for it.
pub const OVERFLOW_FINGERPRINT: &str =
    "-- performance_schema.events_statements_summary_by_digest is full";

const DIGEST_ROWS_QUERY: &str = "SELECT \
    SCHEMA_NAME AS schema_name, \
    DIGEST AS digest, \
    COUNT_STAR AS count_star, \
    SUM_TIMER_WAIT AS sum_timer_wait, \
    MIN_TIMER_WAIT AS min_timer_wait, \
    AVG_TIMER_WAIT AS avg_timer_wait, \
    MAX_TIMER_WAIT AS max_timer_wait, \
    SUM_LOCK_TIME AS sum_lock_time, \
    SUM_ERRORS AS sum_errors, \
    SUM_WARNINGS AS sum_warnings, \
    SUM_ROWS_AFFECTED AS sum_rows_affected, \
    SUM_ROWS_SENT AS sum_rows_sent, \
    SUM_ROWS_EXAMINED AS sum_rows_examined, \
    SUM_CREATED_TMP_DISK_TABLES AS sum_created_tmp_disk_tables, \
    SUM_CREATED_TMP_TABLES AS sum_created_tmp_tables, \
    SUM_SELECT_FULL_JOIN AS sum_select_full_join, \
    SUM_SELECT_FULL_RANGE_JOIN AS sum_select_full_range_join, \
    SUM_SELECT_RANGE AS sum_select_range, \
    SUM_SELECT_RANGE_CHECK AS sum_select_range_check, \
    SUM_SELECT_SCAN AS sum_select_scan, \
    SUM_SORT_MERGE_PASSES AS sum_sort_merge_passes, \
    SUM_SORT_RANGE AS sum_sort_range, \
    SUM_SORT_ROWS AS sum_sort_rows, \
    SUM_SORT_SCAN AS sum_sort_scan, \
    SUM_NO_INDEX_USED AS sum_no_index_used, \
    SUM_NO_GOOD_INDEX_USED AS sum_no_good_index_used \
    FROM performance_schema.events_statements_summary_by_digest";

/// Cumulative counters of one (schema, digest) pair. Timers are picoseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct DigestRow {
    pub schema_name: Option<String>,
    pub digest: Option<String>,
    pub count_star: u64,
    pub sum_timer_wait: u64,
    pub min_timer_wait: u64,
    pub avg_timer_wait: u64,
    pub max_timer_wait: u64,
    pub sum_lock_time: u64,
    pub sum_errors: u64,
    pub sum_warnings: u64,
    pub sum_rows_affected: u64,
    pub sum_rows_sent: u64,
    pub sum_rows_examined: u64,
    pub sum_created_tmp_disk_tables: u64,
    pub sum_created_tmp_tables: u64,
    pub sum_select_full_join: u64,
    pub sum_select_full_range_join: u64,
    pub sum_select_range: u64,
    pub sum_select_range_check: u64,
    pub sum_select_scan: u64,
    pub sum_sort_merge_passes: u64,
    pub sum_sort_range: u64,
    pub sum_sort_rows: u64,
    pub sum_sort_scan: u64,
    pub sum_no_index_used: u64,
    pub sum_no_good_index_used: u64,
}

/// All rows of one class, keyed by schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestClass {
    pub digest_text: String,
    pub rows: BTreeMap<String, DigestRow>,
}

/// One point-in-time read of the digest table, keyed by class id.
pub type Snapshot = BTreeMap<String, DigestClass>;

/// Class id of a digest: hex characters 16..32 upper-cased.
#[must_use]
pub fn class_id(digest: Option<&str>) -> String {
    match digest.map(str::trim) {
        None | Some("") => OVERFLOW_CLASS_ID.to_string(),
        Some(d) => d.get(16..32).unwrap_or(d).to_ascii_uppercase(),
    }
}

/// Where digest rows come from.
pub trait DigestSource: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if MySQL is unreachable.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    fn rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>>>;

    /// `DIGEST_TEXT` of `digest`, `None` for the overflow row.
    fn digest_text<'a>(&'a self, digest: Option<&'a str>) -> BoxFuture<'a, Result<Option<String>>>;
}

/// `DigestSource` reading `performance_schema.events_statements_summary_by_digest`.
pub struct MySqlDigestSource {
    conn: Arc<dyn Connector>,
}

impl MySqlDigestSource {
    #[must_use]
    pub fn new(conn: Arc<dyn Connector>) -> Self {
        Self { conn }
    }
}

impl DigestSource for MySqlDigestSource {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        self.conn.connect()
    }

    #[instrument(skip(self), level = "debug", err, fields(otel.kind = "internal"))]
    fn rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>>> {
        Box::pin(async move {
            let pool = self.conn.pool()?;
            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "SELECT",
                db.statement = DIGEST_ROWS_QUERY,
                otel.kind = "client"
            );
            sqlx::query_as::<_, DigestRow>(DIGEST_ROWS_QUERY)
                .fetch_all(&pool)
                .instrument(span)
                .await
                .context("failed to read events_statements_summary_by_digest")
        })
    }

    fn digest_text<'a>(&'a self, digest: Option<&'a str>) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let pool = self.conn.pool()?;
            let statement = match digest {
                Some(_) => "SELECT DIGEST_TEXT FROM performance_schema.events_statements_summary_by_digest WHERE DIGEST = ? LIMIT 1",
                None => "SELECT DIGEST_TEXT FROM performance_schema.events_statements_summary_by_digest WHERE DIGEST IS NULL LIMIT 1",
            };
            let span = info_span!(
                "db.query",
                db.system = "mysql",
                db.operation = "SELECT",
                db.statement = statement,
                otel.kind = "client"
            );

            let mut query = sqlx::query_scalar::<_, Option<String>>(statement);
            if let Some(digest) = digest {
                query = query.bind(digest);
            }
            let text = query
                .fetch_optional(&pool)
                .instrument(span)
                .await
                .context("failed to read DIGEST_TEXT")?;

            Ok(text.flatten())
        })
    }
}
