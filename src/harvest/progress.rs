//! Lock-free progress counters read by whoever renders the harvest.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use super::types::{FileStatus, JobCounts};
use crate::humanize::format_rate;

/// Progress of one job, written by its worker only.
#[derive(Debug, Default)]
pub struct JobProgress {
    total: AtomicUsize,
    done: AtomicUsize,
    current_transferred: AtomicU64,
    current_expected: AtomicU64,
    bytes: AtomicU64,
}

impl JobProgress {
    pub fn set_total(&self, files: usize) {
        self.total.store(files, Ordering::Relaxed);
    }

    pub fn begin_file(&self, expected: u64) {
        self.current_transferred.store(0, Ordering::Relaxed);
        self.current_expected.store(expected, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.current_transferred.fetch_add(n, Ordering::Relaxed);
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn end_file(&self) {
        self.current_transferred.store(0, Ordering::Relaxed);
        self.current_expected.store(0, Ordering::Relaxed);
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Files not yet finished, including the one in flight.
    pub fn pending(&self) -> usize {
        self.total
            .load(Ordering::Relaxed)
            .saturating_sub(self.done.load(Ordering::Relaxed))
    }

    /// `(done + current_transferred / current_expected) / total`, in 0..=1.
    pub fn fraction(&self) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let done = self.done.load(Ordering::Relaxed) as f64;
        let expected = self.current_expected.load(Ordering::Relaxed);
        let partial = if expected == 0 {
            0.0
        } else {
            (self.current_transferred.load(Ordering::Relaxed) as f64 / expected as f64).min(1.0)
        };
        ((done + partial) / total as f64).min(1.0)
    }
}

/// Running copied/skipped/failed totals across every job.
#[derive(Debug, Default)]
pub struct TotalsCounter {
    copied: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

impl TotalsCounter {
    pub fn record(&self, status: FileStatus) {
        let counter = match status {
            FileStatus::Ok => &self.copied,
            FileStatus::Skipped => &self.skipped,
            FileStatus::Failed => &self.failed,
            FileStatus::Pending | FileStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JobCounts {
        JobCounts {
            copied: self.copied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: 0,
        }
    }
}

/// Bytes/second between successive samples of a byte counter.
#[derive(Debug, Default)]
pub struct ThroughputSampler {
    last: Option<(Instant, u64)>,
}

impl ThroughputSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate since the previous sample; `None` on the first one.
    pub fn sample(&mut self, now: Instant, bytes: u64) -> Option<f64> {
        let previous = self.last.replace((now, bytes));
        let (then, before) = previous?;
        let elapsed = now.saturating_duration_since(then).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(bytes.saturating_sub(before) as f64 / elapsed)
    }

    pub fn sample_formatted(&mut self, now: Instant, bytes: u64) -> String {
        format_rate(self.sample(now, bytes).unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fraction_includes_current_file() {
        let progress = JobProgress::default();
        assert_eq!(progress.fraction(), 0.0);
        progress.set_total(4);
        progress.begin_file(100);
        progress.add_bytes(100);
        progress.end_file();
        progress.begin_file(200);
        progress.add_bytes(100);
        assert!((progress.fraction() - 0.375).abs() < 1e-9);
        assert_eq!(progress.bytes_transferred(), 200);
        assert_eq!(progress.pending(), 3);
    }

    #[test]
    fn test_totals_ignore_non_terminal() {
        let totals = TotalsCounter::default();
        totals.record(FileStatus::Ok);
        totals.record(FileStatus::Running);
        totals.record(FileStatus::Failed);
        let counts = totals.snapshot();
        assert_eq!((counts.copied, counts.skipped, counts.failed), (1, 0, 1));
    }

    #[test]
    fn test_throughput_between_samples() {
        let start = Instant::now();
        let mut sampler = ThroughputSampler::new();
        assert_eq!(sampler.sample(start, 0), None);
        let rate = sampler.sample(start + Duration::from_secs(2), 2_000_000).unwrap();
        assert!((rate - 1_000_000.0).abs() < 1e-6);
    }
}
