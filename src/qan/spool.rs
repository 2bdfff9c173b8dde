use super::report::Report;
use anyhow::{Context, Result, anyhow};
use arc_swap::ArcSwapOption;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Accepts finished reports for asynchronous delivery.
pub trait Spooler: Send + Sync {
    /// Queue `report` without waiting for it to be stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the report was not queued.
    fn write(&self, report: Report) -> Result<()>;
}

/// Writes each report as `<ulid>.json` under a directory.
pub struct FileSpooler {
    dir: PathBuf,
    tx: ArcSwapOption<mpsc::Sender<Report>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileSpooler {
    /// # Errors
    ///
    /// Returns an error if the spool directory cannot be created.
    pub fn spawn(dir: &Path, capacity: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create spool dir {}", dir.display()))?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(drain(dir.to_path_buf(), rx));
        info!(dir = %dir.display(), "spooler started");

        Ok(Self {
            dir: dir.to_path_buf(),
            tx: ArcSwapOption::new(Some(Arc::new(tx))),
            task: Mutex::new(Some(task)),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stop accepting reports and wait until the queued ones are written.
    pub async fn close(&self) {
        self.tx.store(None);
        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "spooler task failed");
        }
    }
}

impl Spooler for FileSpooler {
    fn write(&self, report: Report) -> Result<()> {
        let guard = self.tx.load();
        let Some(tx) = guard.as_ref() else {
            return Err(anyhow!("spooler is closed"));
        };

        match tx.try_send(report) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(report)) => {
                warn!(instance = %report.instance, interval = report.interval, "spool queue full, dropping report");
                Err(anyhow!("spool queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(anyhow!("spooler is closed")),
        }
    }
}

async fn drain(dir: PathBuf, mut rx: mpsc::Receiver<Report>) {
    while let Some(report) = rx.recv().await {
        if let Err(e) = store(&dir, &report).await {
            error!(instance = %report.instance, interval = report.interval, error = %e, "cannot spool report");
        }
    }
    debug!("spooler stopped");
}

async fn store(dir: &Path, report: &Report) -> Result<PathBuf> {
    let data = serde_json::to_vec(report)?;
    let name = Ulid::new().to_string();
    let tmp = dir.join(format!("{name}.json.tmp"));
    let file = dir.join(format!("{name}.json"));

    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &file)
        .await
        .with_context(|| format!("failed to rename {}", tmp.display()))?;

    debug!(file = %file.display(), classes = report.class.len(), "report spooled");
    Ok(file)
}
