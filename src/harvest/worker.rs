//! One device's harvest job: list, filter, then copy files one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::TakeFilter;
use super::progress::{JobProgress, TotalsCounter};
use super::source::{RemoteFile, RemoteSource, SourceError};
use super::types::{FileItem, FileStatus, JobCounts};
use crate::device::{DeviceId, NameFormatter};
use crate::events::{Event, EventSender};
use crate::observability::Metrics;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("listing failed: {0}")]
    Listing(#[from] SourceError),

    #[error("cannot create {path}: {source}")]
    Destination {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

const CANCELLED: &str = "cancelled";

/// Emits the per-file and job-finished events for one job. `finish` fires at
/// most once no matter how many paths reach it.
pub struct JobReporter {
    device_id: DeviceId,
    events: EventSender,
    totals: Arc<TotalsCounter>,
    /// This job's share of `totals`
    seen: TotalsCounter,
    metrics: Arc<Metrics>,
    finished: AtomicBool,
}

impl JobReporter {
    pub fn new(
        device_id: DeviceId,
        events: EventSender,
        totals: Arc<TotalsCounter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            device_id,
            events,
            totals,
            seen: TotalsCounter::default(),
            metrics,
            finished: AtomicBool::new(false),
        }
    }

    pub fn file(&self, item: &FileItem) {
        self.totals.record(item.status);
        self.seen.record(item.status);
        if item.status == FileStatus::Ok {
            self.metrics.file_transferred();
        }
        let _ = self.events.send(Event::FileTransfer {
            device_id: self.device_id,
            local_name: item.local_name(),
            status: item.status,
            error: item.error.clone(),
        });
    }

    /// Returns false if the job had already finished.
    pub fn finish(&self, counts: JobCounts, error: Option<String>) -> bool {
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(
            device_id = %self.device_id,
            copied = counts.copied,
            skipped = counts.skipped,
            failed = counts.failed,
            error = error.as_deref().unwrap_or(""),
            "Harvest job finished"
        );
        let _ = self.events.send(Event::JobFinished {
            device_id: self.device_id,
            copied: counts.copied,
            skipped: counts.skipped,
            failed: counts.failed,
            error,
        });
        true
    }

    /// Files reported so far; what an aborted job still gets credit for.
    pub fn counts(&self) -> JobCounts {
        self.seen.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Final state of a job.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub files: Vec<FileItem>,
    pub counts: JobCounts,
    pub error: Option<String>,
}

pub struct HarvestWorker {
    pub(crate) device_id: DeviceId,
    pub(crate) source: Arc<dyn RemoteSource>,
    pub(crate) formatter: NameFormatter,
    pub(crate) filter: TakeFilter,
    pub(crate) dest: PathBuf,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: Arc<JobProgress>,
    pub(crate) reporter: Arc<JobReporter>,
}

fn part_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// `a/b.mov` under `dest`, refusing names that would escape it.
fn local_ref(name: &str) -> Option<PathBuf> {
    let parts: Vec<_> = name
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    if parts.is_empty() || parts.contains(&"..") {
        return None;
    }
    Some(parts.iter().collect())
}

impl HarvestWorker {
    pub async fn run(self) -> JobOutcome {
        let mut files = match self.prepare().await {
            Ok(files) => files,
            Err(err) => {
                warn!(device_id = %self.device_id, source = %self.source.describe(), error = %err, "Harvest job aborted");
                let error = err.to_string();
                self.reporter.finish(JobCounts::default(), Some(error.clone()));
                return JobOutcome {
                    error: Some(error),
                    ..JobOutcome::default()
                };
            }
        };

        self.progress.set_total(files.len());
        info!(device_id = %self.device_id, files = files.len(), dest = %self.dest.display(), "Harvesting");

        for item in files.iter_mut() {
            if self.cancel.is_cancelled() {
                break;
            }
            self.transfer(item).await;
            self.progress.end_file();
            self.reporter.file(item);
        }

        let counts = JobCounts::from_files(&files);
        let error = self.cancel.is_cancelled().then(|| CANCELLED.to_string());
        self.reporter.finish(counts, error.clone());
        JobOutcome {
            files,
            counts,
            error,
        }
    }

    async fn prepare(&self) -> Result<Vec<FileItem>, HarvestError> {
        fs::create_dir_all(&self.dest)
            .await
            .map_err(|source| HarvestError::Destination {
                path: self.dest.clone(),
                source,
            })?;

        let listed = tokio::select! {
            _ = self.cancel.cancelled() => return Err(HarvestError::Cancelled),
            listed = self.source.list() => listed?,
        };

        let files = listed
            .into_iter()
            .filter(|file| self.filter.matches(&file.name, &self.formatter))
            .filter_map(|file| match local_ref(&file.name) {
                Some(local) => Some(FileItem::new(file.remote_ref, local, file.size)),
                None => {
                    warn!(name = %file.name, "Skipping file with unsafe name");
                    None
                }
            })
            .collect();
        Ok(files)
    }

    async fn transfer(&self, item: &mut FileItem) {
        let local = self.dest.join(&item.local_ref);
        self.progress.begin_file(item.expected_size);

        let existing = fs::metadata(&local).await.ok().filter(|meta| meta.is_file());
        if let Some(meta) = existing {
            if item.expected_size == 0 || meta.len() == item.expected_size {
                debug!(file = %local.display(), "Already harvested");
                item.skip();
                return;
            }
            debug!(
                file = %local.display(),
                local_size = meta.len(),
                expected = item.expected_size,
                "Replacing local file of different size"
            );
        }

        item.start();
        let part = part_path(&local);
        let result = self.stream(item, &part).await;
        let result = match result {
            Ok(()) => self.verify(item, &part, &local).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                debug!(file = %local.display(), bytes = item.transferred_size, "Transferred");
                item.succeed();
            }
            Err(reason) => {
                let _ = fs::remove_file(&part).await;
                warn!(file = %local.display(), error = %reason, "Transfer failed");
                item.fail(reason);
            }
        }
    }

    async fn stream(&self, item: &mut FileItem, part: &Path) -> Result<(), String> {
        if let Some(parent) = part.parent() {
            fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
        }
        if self.cancel.is_cancelled() {
            return Err(CANCELLED.to_string());
        }

        let remote = RemoteFile {
            remote_ref: item.remote_ref.clone(),
            name: item.local_name(),
            size: item.expected_size,
        };
        let mut reader = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CANCELLED.to_string()),
            opened = self.source.open(&remote) => opened.map_err(|e| e.to_string())?,
        };
        if item.expected_size == 0 {
            if let Some(hint) = reader.size_hint() {
                item.expected_size = hint;
                self.progress.begin_file(hint);
            }
        }

        let mut out = fs::File::create(part).await.map_err(|e| e.to_string())?;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CANCELLED.to_string()),
                chunk = reader.next_chunk() => chunk.map_err(|e| e.to_string())?,
            };
            let Some(chunk) = chunk else {
                break;
            };
            out.write_all(&chunk).await.map_err(|e| e.to_string())?;
            item.transferred_size += chunk.len() as u64;
            self.progress.add_bytes(chunk.len() as u64);
        }
        out.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn verify(&self, item: &FileItem, part: &Path, local: &Path) -> Result<(), String> {
        if item.expected_size == 0 {
            return Err("zero sized file".to_string());
        }
        if item.transferred_size != item.expected_size {
            return Err(format!(
                "incomplete: {} of {} bytes",
                item.transferred_size, item.expected_size
            ));
        }
        fs::rename(part, local).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::harvest::directory::DirectorySource;
    use crate::harvest::source::RemoteReader;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;

    /// Lists an 8 byte file and then only ever delivers five bytes of it.
    struct ShortSource;

    struct ShortReader(Option<Bytes>);

    #[async_trait]
    impl RemoteReader for ShortReader {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
            Ok(self.0.take())
        }
    }

    #[async_trait]
    impl RemoteSource for ShortSource {
        fn describe(&self) -> String {
            "short".to_string()
        }

        async fn list(&self) -> Result<Vec<RemoteFile>, SourceError> {
            Ok(vec![RemoteFile {
                remote_ref: "take.mov".to_string(),
                name: "take.mov".to_string(),
                size: 8,
            }])
        }

        async fn open(&self, _file: &RemoteFile) -> Result<Box<dyn RemoteReader>, SourceError> {
            Ok(Box::new(ShortReader(Some(Bytes::from_static(b"12345")))))
        }
    }

    fn worker(source: &Path, dest: &Path) -> (HarvestWorker, events::EventReceiver) {
        worker_over(Arc::new(DirectorySource::new(source, 3)), dest)
    }

    fn worker_over(
        source: Arc<dyn RemoteSource>,
        dest: &Path,
    ) -> (HarvestWorker, events::EventReceiver) {
        let (tx, rx) = events::channel();
        let metrics = Arc::new(Metrics::new());
        let reporter = JobReporter::new(DeviceId(1), tx, Arc::new(TotalsCounter::default()), metrics);
        let worker = HarvestWorker {
            device_id: DeviceId(1),
            source,
            formatter: NameFormatter::new("cam"),
            filter: TakeFilter::All,
            dest: dest.to_path_buf(),
            cancel: CancellationToken::new(),
            progress: Arc::new(JobProgress::default()),
            reporter: Arc::new(reporter),
        };
        (worker, rx)
    }

    #[test]
    fn test_local_ref_rejects_escapes() {
        assert_eq!(local_ref("a/b.mov"), Some(PathBuf::from("a").join("b.mov")));
        assert_eq!(local_ref("../x"), None);
        assert_eq!(local_ref(""), None);
    }

    #[tokio::test]
    async fn test_copies_then_skips_on_second_run() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        std::fs::write(remote.path().join("t1.mov"), b"0123456789").unwrap();
        std::fs::write(remote.path().join("empty.mov"), b"").unwrap();

        let (first, _rx) = worker(remote.path(), local.path());
        let outcome = first.run().await;
        assert_eq!((outcome.counts.copied, outcome.counts.failed), (1, 1));
        let empty = outcome.files.iter().find(|f| f.remote_ref.ends_with("empty.mov")).unwrap();
        assert_eq!(empty.error.as_deref(), Some("zero sized file"));
        assert!(!local.path().join("empty.mov").exists());
        assert!(!local.path().join("t1.mov.part").exists());
        assert_eq!(std::fs::read(local.path().join("t1.mov")).unwrap(), b"0123456789");

        let (second, _rx) = worker(remote.path(), local.path());
        let outcome = second.run().await;
        let t1 = outcome.files.iter().find(|f| f.remote_ref.ends_with("t1.mov")).unwrap();
        assert_eq!(t1.status, FileStatus::Skipped);
    }

    #[tokio::test]
    async fn test_short_transfer_fails_and_leaves_nothing() {
        let local = TempDir::new().unwrap();
        let (job, mut rx) = worker_over(Arc::new(ShortSource), local.path());
        let outcome = job.run().await;

        let take = &outcome.files[0];
        assert_eq!(take.status, FileStatus::Failed);
        assert_eq!(take.transferred_size, 5);
        assert!(take.error.as_deref().unwrap().starts_with("incomplete"));
        assert_eq!(outcome.counts.failed, 1);
        assert!(!local.path().join("take.mov.part").exists());
        assert!(!local.path().join("take.mov").exists());

        let failed = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
            matches!(event, Event::FileTransfer { status: FileStatus::Failed, .. })
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn test_listing_failure_finishes_once() {
        let local = TempDir::new().unwrap();
        let (job, mut rx) = worker(&local.path().join("missing"), local.path());
        let reporter = job.reporter.clone();
        let outcome = job.run().await;
        assert!(outcome.error.unwrap().starts_with("listing failed"));
        assert!(!reporter.finish(JobCounts::default(), None));

        let finished: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|event| matches!(event, Event::JobFinished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
    }
}
