use crate::qan::{Interval, IntervalSource};
use crate::ticker::Tick;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::fs::Metadata;
use std::path::PathBuf;
use tracing::{debug, info};

/// Resolves the slow log path on every tick; it can change at runtime.
pub type FilenameFn = Box<dyn Fn() -> BoxFuture<'static, Result<PathBuf>> + Send + Sync>;

/// OS identity of a file, stable across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(_meta: &Metadata) -> Self {
        Self { dev: 0, ino: 0 }
    }
}

#[derive(Debug, Clone)]
struct LogPosition {
    file: PathBuf,
    identity: FileIdentity,
    size: u64,
    tick: Tick,
}

/// Intervals over byte ranges of the slow log, one per tick after the first.
pub struct SlowLogIntervals {
    filename: FilenameFn,
    number: u64,
    last: Option<LogPosition>,
}

impl SlowLogIntervals {
    #[must_use]
    pub fn new(filename: FilenameFn) -> Self {
        Self {
            filename,
            number: 0,
            last: None,
        }
    }

    /// Intervals over a fixed path.
    #[must_use]
    pub fn with_file(path: PathBuf) -> Self {
        Self::new(Box::new(move || {
            let path = path.clone();
            Box::pin(async move { Ok(path) })
        }))
    }
}

impl IntervalSource for SlowLogIntervals {
    fn tick(&mut self, now: Tick) -> BoxFuture<'_, Result<Option<Interval>>> {
        Box::pin(async move {
            let file = (self.filename)().await?;
            let meta = tokio::fs::metadata(&file)
                .await
                .with_context(|| format!("cannot stat slow log {}", file.display()))?;

            let current = LogPosition {
                file,
                identity: FileIdentity::of(&meta),
                size: meta.len(),
                tick: now,
            };

            let Some(prev) = self.last.replace(current.clone()) else {
                debug!(file = %current.file.display(), offset = current.size, "first tick, interval opened");
                return Ok(None);
            };

            let rotated = prev.file != current.file
                || prev.identity != current.identity
                || current.size < prev.size;
            if rotated {
                info!(
                    previous = %prev.file.display(),
                    file = %current.file.display(),
                    "slow log rotated, starting at offset 0"
                );
            }

            self.number += 1;
            Ok(Some(Interval {
                number: self.number,
                start_time: prev.tick,
                stop_time: now,
                filename: Some(current.file),
                start_offset: if rotated { 0 } else { prev.size },
                end_offset: current.size,
            }))
        })
    }
}
