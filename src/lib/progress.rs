//! A record counter shared by the demultiplexing workers that logs at regular intervals.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

/// The number of records between progress messages.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100_000;

/// Counts records across threads and logs each time a multiple of the interval is passed.
#[derive(Debug)]
pub struct ProgressTracker {
    interval: u64,
    message: String,
    count: AtomicU64,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            interval: DEFAULT_PROGRESS_INTERVAL,
            message: message.into(),
            count: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Adds `additional` records and logs once for every interval boundary crossed.
    ///
    /// Returns the number of boundaries crossed.
    pub fn record(&self, additional: u64) -> u64 {
        let previous = self.count.fetch_add(additional, Ordering::Relaxed);
        let current = previous + additional;
        let crossed = current / self.interval - previous / self.interval;
        for i in (previous / self.interval + 1)..=(current / self.interval) {
            info!("{} {} records", self.message, i * self.interval);
        }
        crossed
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Logs the final count.
    pub fn log_final(&self) {
        info!("{} {} records in total", self.message, self.count());
    }
}
