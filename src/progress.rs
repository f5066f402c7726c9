//! Ingest progress reporting.
//!
//! Progress is counted per archive and logged every 1, 10 or 100 archives
//! depending on verbosity, so a département-sized run (a few thousand
//! sheets) stays readable at the default level while `-vv` shows every
//! sheet. Emission goes through `tracing` on stderr; stdout stays reserved
//! for the final summary.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Archive-level progress counter shared across workers.
pub struct Progress {
    total: u64,
    interval: u64,
    done: AtomicU64,
}

impl Progress {
    /// `verbosity` 0 logs every 100 archives, 1 every 10, 2+ every one.
    pub fn new(total: u64, verbosity: u8) -> Self {
        let interval = match verbosity {
            0 => 100,
            1 => 10,
            _ => 1,
        };
        Self {
            total,
            interval,
            done: AtomicU64::new(0),
        }
    }

    /// Records one finished archive (loaded, skipped or failed) and logs
    /// at the configured interval.
    pub fn archive_done(&self, archive: &str) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if done % self.interval == 0 || done == self.total {
            info!(done, total = self.total, archive, "progress");
        }
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}
