use super::{TICK_DELIVERY_TIMEOUT, first_tick_delay};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Wall-clock time of a tick.
pub type Tick = DateTime<Utc>;

const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

enum Request {
    Add {
        tx: mpsc::Sender<Tick>,
        interval: Duration,
        sync: bool,
    },
    Remove {
        tx: mpsc::Sender<Tick>,
    },
    Eta {
        tx: mpsc::Sender<Tick>,
        reply: oneshot::Sender<Option<f64>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Wall-aligned schedule shared by every sync subscriber of one interval.
struct SyncTicker {
    interval: Duration,
    next: Instant,
    watchers: Vec<mpsc::Sender<Tick>>,
}

/// Unaligned schedule owned by one subscriber.
struct WaitTicker {
    interval: Duration,
    next: Instant,
    tx: mpsc::Sender<Tick>,
}

#[derive(Default)]
struct Scheduler {
    sync: BTreeMap<Duration, SyncTicker>,
    wait: Vec<WaitTicker>,
}

impl Scheduler {
    fn add(&mut self, tx: mpsc::Sender<Tick>, interval: Duration, sync: bool) {
        if self.contains(&tx) {
            debug!("tick subscriber already registered");
            return;
        }

        if sync {
            let ticker = self.sync.entry(interval).or_insert_with(|| {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let delay = first_tick_delay(now, interval);
                debug!(interval = ?interval, delay = ?delay, "starting sync ticker");
                SyncTicker {
                    interval,
                    next: Instant::now() + delay,
                    watchers: Vec::new(),
                }
            });
            ticker.watchers.push(tx);
        } else {
            self.wait.push(WaitTicker {
                interval,
                next: Instant::now(),
                tx,
            });
        }
    }

    fn contains(&self, tx: &mpsc::Sender<Tick>) -> bool {
        self.sync
            .values()
            .any(|t| t.watchers.iter().any(|w| w.same_channel(tx)))
            || self.wait.iter().any(|w| w.tx.same_channel(tx))
    }

    fn remove(&mut self, tx: &mpsc::Sender<Tick>) {
        for ticker in self.sync.values_mut() {
            ticker.watchers.retain(|w| !w.same_channel(tx));
        }
        self.sync.retain(|interval, ticker| {
            let keep = !ticker.watchers.is_empty();
            if !keep {
                debug!(interval = ?interval, "stopping sync ticker");
            }
            keep
        });
        self.wait.retain(|w| !w.tx.same_channel(tx));
    }

    fn eta(&self, tx: &mpsc::Sender<Tick>) -> Option<f64> {
        let now = Instant::now();
        let next = self
            .sync
            .values()
            .find(|t| t.watchers.iter().any(|w| w.same_channel(tx)))
            .map(|t| t.next)
            .or_else(|| {
                self.wait
                    .iter()
                    .find(|w| w.tx.same_channel(tx))
                    .map(|w| w.next)
            })?;
        Some(next.saturating_duration_since(now).as_secs_f64())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sync
            .values()
            .map(|t| t.next)
            .chain(self.wait.iter().map(|w| w.next))
            .min()
    }

    async fn fire(&mut self, now: Instant) {
        for ticker in self.sync.values_mut() {
            if ticker.next > now {
                continue;
            }
            let tick = Utc::now();
            let results = join_all(
                ticker
                    .watchers
                    .iter()
                    .map(|w| w.send_timeout(tick, TICK_DELIVERY_TIMEOUT)),
            )
            .await;
            let mut delivered = results.into_iter();
            ticker.watchers.retain(|_| match delivered.next() {
                Some(Err(SendTimeoutError::Closed(_))) => false,
                Some(Err(SendTimeoutError::Timeout(_))) => {
                    warn!(interval = ?ticker.interval, "subscriber missed tick");
                    true
                }
                _ => true,
            });
            ticker.next = advance(ticker.next, ticker.interval, now);
        }
        self.sync.retain(|_, t| !t.watchers.is_empty());

        let due: Vec<usize> = (0..self.wait.len())
            .filter(|&i| self.wait.get(i).is_some_and(|w| w.next <= now))
            .collect();
        let tick = Utc::now();
        let results = join_all(due.iter().filter_map(|&i| {
            self.wait
                .get(i)
                .map(|w| w.tx.send_timeout(tick, TICK_DELIVERY_TIMEOUT))
        }))
        .await;

        let mut closed = Vec::new();
        for (&i, result) in due.iter().zip(results) {
            match result {
                Err(SendTimeoutError::Closed(_)) => closed.push(i),
                Err(SendTimeoutError::Timeout(_)) => warn!("subscriber missed tick"),
                Ok(()) => {}
            }
            if let Some(w) = self.wait.get_mut(i) {
                w.next = advance(w.next, w.interval, now);
            }
        }
        for i in closed.into_iter().rev() {
            self.wait.remove(i);
        }
    }
}

/// Next deadline after `now`, skipping ticks that were missed entirely.
fn advance(mut next: Instant, interval: Duration, now: Instant) -> Instant {
    if interval.is_zero() {
        return now + IDLE_WAKEUP;
    }
    while next <= now {
        next += interval;
    }
    next
}

/// The tick scheduler. One actor task owns every schedule and subscriber.
pub struct Clock {
    handle: ClockHandle,
    task: Option<JoinHandle<()>>,
}

/// Cloneable request handle for a running `Clock`.
#[derive(Clone)]
pub struct ClockHandle {
    requests: mpsc::Sender<Request>,
}

impl Clock {
    #[must_use]
    pub fn spawn() -> Self {
        let (requests, rx) = mpsc::channel(32);
        let task = tokio::spawn(run(rx));
        Self {
            handle: ClockHandle { requests },
            task: Some(task),
        }
    }

    #[must_use]
    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    /// Stop ticking and wait for the scheduler to exit. Safe to call twice.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        let (ack, done) = oneshot::channel();
        if self.handle.requests.send(Request::Stop { ack }).await.is_ok() {
            let _ = done.await;
        }
        if let Err(e) = task.await {
            warn!(error = %e, "clock task failed");
        }
    }
}

impl ClockHandle {
    /// Deliver ticks to `tx` every `interval`, wall-aligned if `sync`.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock has stopped.
    pub async fn add(&self, tx: mpsc::Sender<Tick>, interval: Duration, sync: bool) -> Result<()> {
        self.requests
            .send(Request::Add { tx, interval, sync })
            .await
            .map_err(|_| anyhow!("clock is not running"))
    }

    pub async fn remove(&self, tx: &mpsc::Sender<Tick>) {
        let _ = self.requests.send(Request::Remove { tx: tx.clone() }).await;
    }

    /// Seconds until the next tick for `tx`, `None` if it is not registered.
    pub async fn eta(&self, tx: &mpsc::Sender<Tick>) -> Option<f64> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Eta {
                tx: tx.clone(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }
}

async fn run(mut requests: mpsc::Receiver<Request>) {
    let mut scheduler = Scheduler::default();
    info!("clock started");

    loop {
        let deadline = scheduler
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKEUP);

        tokio::select! {
            req = requests.recv() => match req {
                Some(Request::Add { tx, interval, sync }) => scheduler.add(tx, interval, sync),
                Some(Request::Remove { tx }) => scheduler.remove(&tx),
                Some(Request::Eta { tx, reply }) => {
                    let _ = reply.send(scheduler.eta(&tx));
                }
                Some(Request::Stop { ack }) => {
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
            () = sleep_until(deadline) => scheduler.fire(Instant::now()).await,
        }
    }

    info!("clock stopped");
}
