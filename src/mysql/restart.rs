use super::Connector;
use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Tolerance for the observed uptime lagging behind the expected uptime.
const UPTIME_SLACK_SECS: u64 = 5;

/// Whether MySQL restarted between two uptime observations.
///
/// `previous` was observed `elapsed` ago; if the server kept running it should
/// now report roughly `previous + elapsed`.
#[must_use]
pub fn is_restart(previous: u64, elapsed: Duration, observed: u64) -> bool {
    let expected = previous.saturating_add(elapsed.as_secs());
    observed < previous || observed.saturating_add(UPTIME_SLACK_SECS) < expected
}

enum Request {
    Add {
        name: String,
        conn: Arc<dyn Connector>,
        listener: mpsc::Sender<()>,
    },
    Remove {
        name: String,
    },
    Subscribe {
        listener: mpsc::Sender<String>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

struct Instance {
    conn: Arc<dyn Connector>,
    listeners: Vec<mpsc::Sender<()>>,
    last: Option<(u64, Instant)>,
}

/// Polls `Uptime` of every registered instance and notifies listeners when
/// an instance restarted.
pub struct RestartMonitor {
    requests: mpsc::Sender<Request>,
    task: Option<JoinHandle<()>>,
}

/// Cloneable registration handle for a running `RestartMonitor`.
#[derive(Clone)]
pub struct RestartMonitorHandle {
    requests: mpsc::Sender<Request>,
}

impl RestartMonitor {
    #[must_use]
    pub fn spawn(poll_interval: Duration) -> Self {
        let (requests, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, poll_interval));
        Self {
            requests,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn handle(&self) -> RestartMonitorHandle {
        RestartMonitorHandle {
            requests: self.requests.clone(),
        }
    }

    /// Stop polling and wait for the monitor task to exit. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        let (ack, done) = oneshot::channel();
        if self.requests.send(Request::Stop { ack }).await.is_ok() {
            let _ = done.await;
        }
        if let Err(e) = task.await {
            warn!(error = %e, "restart monitor task failed");
        }
    }
}

impl RestartMonitorHandle {
    /// Watch `name`; `listener` receives `()` every time it restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor has stopped.
    pub async fn add(
        &self,
        name: &str,
        conn: Arc<dyn Connector>,
        listener: mpsc::Sender<()>,
    ) -> Result<()> {
        self.requests
            .send(Request::Add {
                name: name.to_string(),
                conn,
                listener,
            })
            .await
            .map_err(|_| anyhow!("restart monitor is not running"))
    }

    pub async fn remove(&self, name: &str) {
        let _ = self
            .requests
            .send(Request::Remove {
                name: name.to_string(),
            })
            .await;
    }

    /// Receive the name of every instance that restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor has stopped.
    pub async fn subscribe(&self, listener: mpsc::Sender<String>) -> Result<()> {
        self.requests
            .send(Request::Subscribe { listener })
            .await
            .map_err(|_| anyhow!("restart monitor is not running"))
    }
}

async fn run(mut requests: mpsc::Receiver<Request>, poll_interval: Duration) {
    let mut instances: BTreeMap<String, Instance> = BTreeMap::new();
    let mut global: Vec<mpsc::Sender<String>> = Vec::new();
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(poll_interval = ?poll_interval, "restart monitor started");

    loop {
        tokio::select! {
            req = requests.recv() => match req {
                Some(Request::Add { name, conn, listener }) => {
                    let instance = instances.entry(name).or_insert_with(|| Instance {
                        conn,
                        listeners: Vec::new(),
                        last: None,
                    });
                    instance.listeners.push(listener);
                }
                Some(Request::Remove { name }) => {
                    if let Some(instance) = instances.remove(&name) {
                        instance.conn.close().await;
                    }
                }
                Some(Request::Subscribe { listener }) => global.push(listener),
                Some(Request::Stop { ack }) => {
                    for instance in instances.values() {
                        instance.conn.close().await;
                    }
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                for (name, instance) in &mut instances {
                    if poll(name, instance).await {
                        for listener in &global {
                            if listener.try_send(name.clone()).is_err() {
                                debug!(instance = %name, "restart listener not ready");
                            }
                        }
                    }
                }
            }
        }
    }

    info!("restart monitor stopped");
}

/// Returns true if the instance restarted since the last poll.
async fn poll(name: &str, instance: &mut Instance) -> bool {
    if let Err(e) = instance.conn.connect().await {
        debug!(instance = %name, error = %e, "cannot connect to check uptime");
        return false;
    }

    let uptime = match instance.conn.uptime().await {
        Ok(uptime) => uptime,
        Err(e) => {
            debug!(instance = %name, error = %e, "cannot read uptime");
            return false;
        }
    };

    let now = Instant::now();
    let restarted = instance
        .last
        .is_some_and(|(previous, at)| is_restart(previous, now.duration_since(at), uptime));
    instance.last = Some((uptime, now));

    if restarted {
        warn!(instance = %name, uptime, "MySQL restart detected");
        instance
            .listeners
            .retain(|listener| !listener.is_closed());
        for listener in &instance.listeners {
            let _ = listener.try_send(());
        }
    }

    restarted
}
