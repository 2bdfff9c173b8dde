use crate::query::{self, FingerprintError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type FingerprintFn = Arc<dyn Fn(&str) -> Result<String, FingerprintError> + Send + Sync>;

struct Request {
    query: String,
    reply: oneshot::Sender<Result<String, FingerprintError>>,
}

struct Task {
    tx: mpsc::Sender<Request>,
    handle: JoinHandle<()>,
}

/// Fingerprints queries on a separate task so a crash costs one event,
/// not the worker. A crashed task is replaced on the next request.
pub struct Fingerprinter {
    func: FingerprintFn,
    task: Option<Task>,
    restarts: u64,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprinter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_fn(Arc::new(query::fingerprint))
    }

    #[must_use]
    pub fn with_fn(func: FingerprintFn) -> Self {
        Self {
            func,
            task: None,
            restarts: 0,
        }
    }

    /// Times the sub-task had to be restarted.
    #[must_use]
    pub const fn restarts(&self) -> u64 {
        self.restarts
    }

    /// # Errors
    ///
    /// Returns `FingerprintError::Crashed` if the sub-task died while
    /// handling `query`; it is restarted for the next call.
    pub async fn fingerprint(&mut self, query: &str) -> Result<String, FingerprintError> {
        let tx = match &self.task {
            Some(task) => task.tx.clone(),
            None => self.spawn(),
        };

        let (reply, rx) = oneshot::channel();
        let request = Request {
            query: query.to_string(),
            reply,
        };
        if tx.send(request).await.is_err() {
            self.crashed();
            return Err(FingerprintError::Crashed);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                self.crashed();
                Err(FingerprintError::Crashed)
            }
        }
    }

    fn spawn(&mut self) -> mpsc::Sender<Request> {
        let (tx, mut rx) = mpsc::channel::<Request>(1);
        let func = Arc::clone(&self.func);
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = func(&request.query);
                let _ = request.reply.send(result);
            }
        });
        debug!("fingerprinter started");
        self.task = Some(Task {
            tx: tx.clone(),
            handle,
        });
        tx
    }

    fn crashed(&mut self) {
        if let Some(task) = self.task.take() {
            task.handle.abort();
        }
        self.restarts += 1;
        warn!(restarts = self.restarts, "fingerprinter crashed, restarting");
    }
}

impl Drop for Fingerprinter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.handle.abort();
        }
    }
}
