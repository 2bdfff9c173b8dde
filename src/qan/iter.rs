use super::{Interval, IntervalSource};
use crate::ticker::Tick;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a finished interval waits for its consumer before it is dropped.
pub const INTERVAL_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Actor that turns ticks into intervals using an `IntervalSource`.
pub struct IntervalIter {
    name: String,
    stop: Option<oneshot::Sender<oneshot::Sender<()>>>,
    task: Option<JoinHandle<()>>,
}

impl IntervalIter {
    /// Start iterating; intervals are delivered on the returned receiver.
    #[must_use]
    pub fn spawn(
        name: &str,
        source: Box<dyn IntervalSource>,
        ticks: mpsc::Receiver<Tick>,
    ) -> (Self, mpsc::Receiver<Interval>) {
        let (out, intervals) = mpsc::channel(1);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(name.to_string(), source, ticks, out, stop_rx));

        (
            Self {
                name: name.to_string(),
                stop: Some(stop),
                task: Some(task),
            },
            intervals,
        )
    }

    /// Stop and wait for the iterator task to exit. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        if let Some(stop) = self.stop.take() {
            let (ack, done) = oneshot::channel();
            if stop.send(ack).is_ok() {
                let _ = done.await;
            }
        }
        if let Err(e) = task.await {
            warn!(instance = %self.name, error = %e, "interval iterator task failed");
        }
    }
}

async fn run(
    name: String,
    mut source: Box<dyn IntervalSource>,
    mut ticks: mpsc::Receiver<Tick>,
    out: mpsc::Sender<Interval>,
    mut stop: oneshot::Receiver<oneshot::Sender<()>>,
) {
    debug!(instance = %name, "interval iterator started");

    loop {
        tokio::select! {
            biased;

            ack = &mut stop => {
                if let Ok(ack) = ack {
                    let _ = ack.send(());
                }
                break;
            }

            tick = ticks.recv() => {
                let Some(now) = tick else {
                    break;
                };

                let interval = match source.tick(now).await {
                    Ok(Some(interval)) => interval,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(instance = %name, error = %e, "cannot compute interval");
                        continue;
                    }
                };

                let number = interval.number;
                match out.send_timeout(interval, INTERVAL_DELIVERY_TIMEOUT).await {
                    Ok(()) => debug!(instance = %name, interval = number, "interval sent"),
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(instance = %name, interval = number, "lost interval, consumer not ready");
                    }
                    Err(SendTimeoutError::Closed(_)) => break,
                }
            }
        }
    }

    info!(instance = %name, "interval iterator stopped");
}
