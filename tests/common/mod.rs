use anyhow::{Result, anyhow};
use chrono::TimeDelta;
use futures::future::BoxFuture;
use qan_agent::mysql::Connector;
use qan_agent::qan::perfschema::{DigestRow, DigestSource};
use qan_agent::qan::report::Report;
use qan_agent::qan::spool::Spooler;
use sqlx::MySqlPool;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Get an available port for testing
#[allow(dead_code)]
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Build test URL for HTTP requests
#[allow(dead_code)]
pub fn get_test_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// Wait for server to be ready
#[allow(dead_code)]
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    for _ in 0..max_attempts {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Connector with scripted variables and uptime, recording executed statements.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockConnector {
    pub vars: Mutex<BTreeMap<String, String>>,
    pub executed: Mutex<Vec<String>>,
    pub uptimes: Mutex<VecDeque<u64>>,
    pub fail_connect: AtomicBool,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(self, name: &str, value: &str) -> Self {
        self.vars
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Uptime readings returned in order; the last one repeats.
    pub fn with_uptimes(self, uptimes: &[u64]) -> Self {
        self.uptimes.lock().unwrap().extend(uptimes);
        self
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail_connect.load(Ordering::SeqCst) {
                Err(anyhow!("connection refused"))
            } else {
                Ok(())
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn pool(&self) -> Result<MySqlPool> {
        Err(anyhow!("mock connector has no pool"))
    }

    fn exec<'a>(&'a self, statements: &'a [String]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.executed
                .lock()
                .unwrap()
                .extend(statements.iter().cloned());
            Ok(())
        })
    }

    fn global_var_string<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.vars
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown variable {name}"))
        })
    }

    fn global_var_number<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            let value = self.global_var_string(name).await?;
            Ok(value.parse()?)
        })
    }

    fn uptime(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let mut uptimes = self.uptimes.lock().unwrap();
            if uptimes.len() > 1 {
                Ok(uptimes.pop_front().unwrap())
            } else {
                uptimes.front().copied().ok_or_else(|| anyhow!("no uptime"))
            }
        })
    }

    fn utc_offset(&self) -> BoxFuture<'_, Result<TimeDelta>> {
        Box::pin(async { Ok(TimeDelta::zero()) })
    }
}

#[allow(dead_code)]
struct Script {
    snapshots: Mutex<VecDeque<Vec<DigestRow>>>,
    last: Mutex<Vec<DigestRow>>,
    reads: AtomicUsize,
    text_lookups: AtomicUsize,
    fail_connect: AtomicBool,
}

/// Digest source replaying one row set per read; the last one repeats.
#[allow(dead_code)]
#[derive(Clone)]
pub struct ScriptedDigestSource {
    script: Arc<Script>,
}

#[allow(dead_code)]
impl ScriptedDigestSource {
    pub fn new(snapshots: Vec<Vec<DigestRow>>) -> Self {
        Self {
            script: Arc::new(Script {
                snapshots: Mutex::new(snapshots.into()),
                last: Mutex::new(Vec::new()),
                reads: AtomicUsize::new(0),
                text_lookups: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
            }),
        }
    }

    pub fn reads(&self) -> usize {
        self.script.reads.load(Ordering::SeqCst)
    }

    pub fn text_lookups(&self) -> usize {
        self.script.text_lookups.load(Ordering::SeqCst)
    }

    pub fn set_connect_failing(&self, failing: bool) {
        self.script.fail_connect.store(failing, Ordering::SeqCst);
    }
}

impl DigestSource for ScriptedDigestSource {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.script.fail_connect.load(Ordering::SeqCst) {
                Err(anyhow!("connection refused"))
            } else {
                Ok(())
            }
        })
    }

    fn rows(&self) -> BoxFuture<'_, Result<Vec<DigestRow>>> {
        Box::pin(async move {
            self.script.reads.fetch_add(1, Ordering::SeqCst);
            let mut last = self.script.last.lock().unwrap();
            if let Some(next) = self.script.snapshots.lock().unwrap().pop_front() {
                *last = next;
            }
            Ok(last.clone())
        })
    }

    fn digest_text<'a>(&'a self, digest: Option<&'a str>) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            self.script.text_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(digest.map(|d| format!("SELECT {d}")))
        })
    }
}

/// Cumulative digest counters for one schema. Timers are picoseconds.
#[allow(dead_code)]
pub fn digest_row(digest: &str, schema: &str, count: u64, sum_timer_wait: u64) -> DigestRow {
    DigestRow {
        schema_name: Some(schema.to_string()),
        digest: Some(digest.to_string()),
        count_star: count,
        sum_timer_wait,
        min_timer_wait: 1_000_000,
        avg_timer_wait: sum_timer_wait.checked_div(count).unwrap_or_default(),
        max_timer_wait: 5_000_000_000,
        sum_rows_examined: count * 10,
        ..DigestRow::default()
    }
}

/// Spooler handing reports to the test.
#[allow(dead_code)]
pub struct MemorySpooler {
    tx: mpsc::UnboundedSender<Report>,
}

#[allow(dead_code)]
impl MemorySpooler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Spooler for MemorySpooler {
    fn write(&self, report: Report) -> Result<()> {
        self.tx
            .send(report)
            .map_err(|_| anyhow!("report receiver dropped"))
    }
}

/// Append one slow log entry per `(query, query_time)` and return the new file size.
#[allow(dead_code)]
pub fn append_slow_log(path: &Path, events: &[(&str, f64)]) -> u64 {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();

    for (i, (query, query_time)) in events.iter().enumerate() {
        write!(
            file,
            "# Time: 2024-01-01T10:00:{i:02}.000000Z\n\
             # User@Host: app[app] @ localhost []  Id:     7\n\
             # Query_time: {query_time:.6}  Lock_time: 0.000010 Rows_sent: 1  Rows_examined: 10\n\
             SET timestamp=1704103200;\n\
             {query};\n"
        )
        .unwrap();
    }
    file.flush().unwrap();

    std::fs::metadata(path).unwrap().len()
}
