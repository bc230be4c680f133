//! Background watcher that polls the xlogfile and feeds completed games to
//! the completion handler.
//!
//! The monitor holds a monotonic byte offset in memory for the life of the
//! task; records are dispatched in file order within a tick and no byte
//! range is processed twice. A failure handling one record is logged and
//! the loop moves on to the next tick, never terminating the process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::completion;
use crate::xlog::XlogWatcher;
use crate::Arena;

pub struct GameMonitor {
    watcher: XlogWatcher,
    interval: Duration,
}

impl GameMonitor {
    /// Monitor starting at the current end of the xlogfile.
    pub fn new(path: PathBuf, interval: Duration) -> Self {
        GameMonitor {
            watcher: XlogWatcher::new(path),
            interval,
        }
    }

    /// Monitor with an explicit starting offset, for tests and recovery.
    pub fn from_offset(path: PathBuf, offset: u64, interval: Duration) -> Self {
        GameMonitor {
            watcher: XlogWatcher::from_offset(path, offset),
            interval,
        }
    }

    /// One poll cycle: read everything appended since the last tick and
    /// dispatch each record in file order. Errors never escape a tick.
    pub async fn tick(&mut self, arena: &Arena) {
        let records = match self.watcher.poll() {
            Ok(records) => records,
            Err(err) => {
                error!(%err, "failed to read xlogfile");
                return;
            }
        };
        for record in records {
            if let Err(err) = completion::handle_record(arena, &record).await {
                error!(%err, character = %record.name, "failed to handle completed game");
            }
        }
    }

    /// Run until the shutdown channel fires. An in-flight tick finishes
    /// before the task exits.
    pub async fn run(mut self, arena: Arc<Arena>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            path = %arena.config.xlogfile_path.display(),
            interval_ms = self.interval.as_millis() as u64,
            "game monitor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(&arena).await,
                _ = shutdown.changed() => {
                    info!("game monitor stopped");
                    break;
                }
            }
        }
    }
}
