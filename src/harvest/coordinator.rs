//! Runs one harvest worker per device and aggregates their results.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::filter::TakeFilter;
use super::progress::{JobProgress, TotalsCounter};
use super::source::RemoteSource;
use super::types::JobCounts;
use super::worker::{HarvestWorker, JobOutcome, JobReporter};
use crate::device::{DeviceId, NameFormatter};
use crate::events::EventSender;
use crate::observability::Metrics;

/// One device to harvest.
#[derive(Clone)]
pub struct HarvestTarget {
    pub device_id: DeviceId,
    pub device_name: String,
    pub source: Arc<dyn RemoteSource>,
    pub formatter: NameFormatter,
}

#[derive(bon::Builder)]
pub struct HarvestRequest {
    /// Each device gets `{root}/{device_name}`
    #[builder(into)]
    pub root: PathBuf,
    #[builder(default)]
    pub targets: Vec<HarvestTarget>,
    #[builder(default)]
    pub filter: TakeFilter,
}

#[derive(Debug, Clone)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub totals: JobCounts,
    pub jobs: BTreeMap<DeviceId, JobOutcome>,
}

struct Job {
    device_name: String,
    dest: PathBuf,
    cancel: CancellationToken,
    progress: Arc<JobProgress>,
    reporter: Arc<JobReporter>,
    handle: Option<JoinHandle<JobOutcome>>,
    outcome: Option<JobOutcome>,
}

impl Job {
    fn is_done(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Collect the worker's result, giving up after `limit`.
    async fn settle(&mut self, limit: Option<Duration>) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let joined = match limit {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(device = %self.device_name, "Harvest worker did not stop in time, aborting");
                    handle.abort();
                    handle.await
                }
            },
            None => handle.await,
        };

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                let error = if err.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    format!("worker failed: {err}")
                };
                remove_partials(&self.dest).await;
                let mut counts = self.reporter.counts();
                counts.pending = self.progress.pending();
                JobOutcome {
                    files: Vec::new(),
                    counts,
                    error: Some(error),
                }
            }
        };
        // An aborted worker never reached its own finish.
        self.reporter.finish(outcome.counts, outcome.error.clone());
        self.outcome = Some(outcome);
    }
}

/// Flat directory for a device. A name that had to be rewritten carries
/// the device id so it cannot land on another device's directory.
fn directory_name(device_name: &str, device_id: DeviceId) -> String {
    let name: String = device_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    match name.trim() {
        "" | "." | ".." => format!("device_{device_id}"),
        trimmed if trimmed == device_name => trimmed.to_string(),
        trimmed => format!("{trimmed}_{device_id}"),
    }
}

/// Delete `*.part` files under `dir` left by a worker that was aborted
/// mid-write.
async fn remove_partials(dir: &Path) {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => pending.push(path),
                Ok(kind) if kind.is_file() && path.extension().is_some_and(|ext| ext == "part") => {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => debug!(file = %path.display(), "Removed partial file"),
                        Err(err) => warn!(file = %path.display(), error = %err, "Cannot remove partial file"),
                    }
                }
                _ => {}
            }
        }
    }
}

pub struct HarvestCoordinator {
    events: EventSender,
    metrics: Arc<Metrics>,
    cancel_wait: Duration,
    totals: Arc<TotalsCounter>,
    jobs: BTreeMap<DeviceId, Job>,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl HarvestCoordinator {
    pub fn new(events: EventSender, metrics: Arc<Metrics>, cancel_wait: Duration) -> Self {
        Self {
            events,
            metrics,
            cancel_wait,
            totals: Arc::new(TotalsCounter::default()),
            jobs: BTreeMap::new(),
            run_id: Uuid::now_v7(),
            started_at: Utc::now(),
        }
    }

    /// Start a worker per target. A device already harvesting is stopped
    /// first; devices not in the request keep running.
    pub async fn start(&mut self, request: HarvestRequest) -> Uuid {
        if self.is_done() {
            self.jobs.clear();
            self.totals = Arc::new(TotalsCounter::default());
            self.run_id = Uuid::now_v7();
            self.started_at = Utc::now();
        }
        self.metrics.harvest_started();
        info!(run_id = %self.run_id, devices = request.targets.len(), root = %request.root.display(), "Starting harvest");

        for target in request.targets {
            if let Some(mut previous) = self.jobs.remove(&target.device_id) {
                info!(device = %previous.device_name, "Replacing running harvest");
                previous.cancel.cancel();
                previous.settle(Some(self.cancel_wait)).await;
            }

            let mut dir = directory_name(&target.device_name, target.device_id);
            if self.jobs.values().any(|job| job.dest == request.root.join(&dir)) {
                dir = format!("{dir}_{}", target.device_id);
            }
            let dest = request.root.join(dir);

            let cancel = CancellationToken::new();
            let progress = Arc::new(JobProgress::default());
            let reporter = Arc::new(JobReporter::new(
                target.device_id,
                self.events.clone(),
                self.totals.clone(),
                self.metrics.clone(),
            ));
            let worker = HarvestWorker {
                device_id: target.device_id,
                source: target.source,
                formatter: target.formatter,
                filter: request.filter.clone(),
                dest: dest.clone(),
                cancel: cancel.clone(),
                progress: progress.clone(),
                reporter: reporter.clone(),
            };
            let span = info_span!(
                "harvest",
                run_id = %self.run_id,
                device_id = %target.device_id,
                device = %target.device_name
            );
            let handle = tokio::spawn(worker.run().instrument(span));

            self.jobs.insert(
                target.device_id,
                Job {
                    device_name: target.device_name,
                    dest,
                    cancel,
                    progress,
                    reporter,
                    handle: Some(handle),
                    outcome: None,
                },
            );
        }
        self.run_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Copied/skipped/failed summed over every job so far.
    pub fn totals(&self) -> JobCounts {
        self.totals.snapshot()
    }

    /// Mean of the per-job fractions.
    pub fn progress(&self) -> f64 {
        if self.jobs.is_empty() {
            return 1.0;
        }
        let sum: f64 = self
            .jobs
            .values()
            .map(|job| if job.is_done() { 1.0 } else { job.progress.fraction() })
            .sum();
        sum / self.jobs.len() as f64
    }

    pub fn job_progress(&self, device_id: DeviceId) -> Option<f64> {
        self.jobs.get(&device_id).map(|job| job.progress.fraction())
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.jobs
            .values()
            .map(|job| job.progress.bytes_transferred())
            .sum()
    }

    /// True once every worker has finished or been cancelled.
    pub fn is_done(&self) -> bool {
        self.jobs.values().all(Job::is_done)
    }

    /// Wait for every worker to finish on its own.
    pub async fn wait(&mut self) -> HarvestSummary {
        for job in self.jobs.values_mut() {
            job.settle(None).await;
        }
        self.summary()
    }

    /// Cancel one device's job. Harmless when it already finished.
    pub async fn cancel(&mut self, device_id: DeviceId) {
        if let Some(job) = self.jobs.get_mut(&device_id) {
            job.cancel.cancel();
            job.settle(Some(self.cancel_wait)).await;
        }
    }

    /// Cancel every job and return once none is still writing.
    pub async fn cancel_all(&mut self) -> HarvestSummary {
        for job in self.jobs.values() {
            job.cancel.cancel();
        }
        for job in self.jobs.values_mut() {
            job.settle(Some(self.cancel_wait)).await;
        }
        self.summary()
    }

    fn summary(&self) -> HarvestSummary {
        HarvestSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            totals: self.totals(),
            jobs: self
                .jobs
                .iter()
                .filter_map(|(id, job)| job.outcome.clone().map(|outcome| (*id, outcome)))
                .collect(),
        }
    }
}

impl Drop for HarvestCoordinator {
    fn drop(&mut self) {
        for job in self.jobs.values() {
            job.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, Event};
    use crate::harvest::directory::DirectorySource;
    use crate::harvest::types::FileItem;
    use tempfile::TempDir;

    fn target(id: u32, name: &str, dir: &std::path::Path) -> HarvestTarget {
        HarvestTarget {
            device_id: DeviceId(id),
            device_name: name.to_string(),
            source: Arc::new(DirectorySource::new(dir, 1024)),
            formatter: NameFormatter::new(name),
        }
    }

    #[test]
    fn test_directory_name_is_flat() {
        assert_eq!(directory_name("cam_a", DeviceId(1)), "cam_a");
        assert_eq!(directory_name("cam/a", DeviceId(2)), "cam_a_2");
        assert_eq!(directory_name("..", DeviceId(3)), "device_3");
    }

    #[tokio::test]
    async fn test_rewritten_names_get_their_own_directory() {
        let remote = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(remote.path().join("t1.mov"), b"abc").unwrap();

        let (tx, _rx) = events::channel();
        let mut coordinator =
            HarvestCoordinator::new(tx, Arc::new(Metrics::new()), Duration::from_secs(1));
        coordinator
            .start(
                HarvestRequest::builder()
                    .root(root.path())
                    .targets(vec![
                        target(1, "cam_a", remote.path()),
                        target(2, "cam/a", remote.path()),
                        target(3, "cam_a", remote.path()),
                    ])
                    .build(),
            )
            .await;
        let summary = coordinator.wait().await;

        assert_eq!(summary.totals.copied, 3);
        assert!(root.path().join("cam_a/t1.mov").exists());
        assert!(root.path().join("cam_a_2/t1.mov").exists());
        assert!(root.path().join("cam_a_3/t1.mov").exists());
    }

    #[tokio::test]
    async fn test_aborted_worker_keeps_counts_and_drops_partials() {
        let dest = TempDir::new().unwrap();
        std::fs::create_dir(dest.path().join("nested")).unwrap();
        std::fs::write(dest.path().join("done.mov"), b"abc").unwrap();
        std::fs::write(dest.path().join("nested/stuck.mov.part"), b"ab").unwrap();

        let (tx, mut rx) = events::channel();
        let totals = Arc::new(TotalsCounter::default());
        let reporter = Arc::new(JobReporter::new(
            DeviceId(4),
            tx,
            totals.clone(),
            Arc::new(Metrics::new()),
        ));
        let mut copied = FileItem::new("done.mov", "done.mov", 3);
        copied.start();
        copied.succeed();
        reporter.file(&copied);
        let progress = Arc::new(JobProgress::default());
        progress.set_total(3);
        progress.end_file();

        let mut job = Job {
            device_name: "deck".to_string(),
            dest: dest.path().to_path_buf(),
            cancel: CancellationToken::new(),
            progress,
            reporter,
            handle: Some(tokio::spawn(std::future::pending::<JobOutcome>())),
            outcome: None,
        };
        job.cancel.cancel();
        job.settle(Some(Duration::from_millis(20))).await;

        let outcome = job.outcome.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("cancelled"));
        assert_eq!((outcome.counts.copied, outcome.counts.pending), (1, 2));
        assert_eq!(totals.snapshot().copied, 1);
        assert!(dest.path().join("done.mov").exists());
        assert!(!dest.path().join("nested/stuck.mov.part").exists());

        let finished: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, Event::JobFinished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
        assert!(matches!(finished[0], Event::JobFinished { copied: 1, .. }));
    }

    #[tokio::test]
    async fn test_jobs_land_in_device_directories() {
        let remote = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        std::fs::write(remote.path().join("t1.mov"), b"abc").unwrap();

        let (tx, mut rx) = events::channel();
        let mut coordinator =
            HarvestCoordinator::new(tx, Arc::new(Metrics::new()), Duration::from_secs(1));
        let request = HarvestRequest::builder()
            .root(root.path())
            .targets(vec![target(1, "a", remote.path()), target(2, "b", remote.path())])
            .build();
        let run_id = coordinator.start(request).await;
        let summary = coordinator.wait().await;

        assert_eq!(summary.run_id, run_id);
        assert_eq!(summary.totals.copied, 2);
        assert!(coordinator.is_done());
        assert!(root.path().join("a/t1.mov").exists());
        assert!(root.path().join("b/t1.mov").exists());

        let finished = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, Event::JobFinished { .. }))
            .count();
        assert_eq!(finished, 2);
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_silent() {
        let remote = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let (tx, mut rx) = events::channel();
        let mut coordinator =
            HarvestCoordinator::new(tx, Arc::new(Metrics::new()), Duration::from_secs(1));
        coordinator
            .start(
                HarvestRequest::builder()
                    .root(root.path())
                    .targets(vec![target(1, "a", remote.path())])
                    .build(),
            )
            .await;
        coordinator.wait().await;
        coordinator.cancel(DeviceId(1)).await;
        coordinator.cancel_all().await;

        let finished = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, Event::JobFinished { .. }))
            .count();
        assert_eq!(finished, 1);
    }
}
