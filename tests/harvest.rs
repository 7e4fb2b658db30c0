//! Harvest coordinator scenarios against in-process remote sources.

use async_trait::async_trait;
use axum::{Json, Router, extract::Path as UrlPath, http::StatusCode, routing::get};
use bytes::Bytes;
use serde_json::json;
use stagehand::device::{DeviceId, NameFormatter};
use stagehand::events::{self, Event, EventReceiver};
use stagehand::harvest::{
    FileStatus, HarvestCoordinator, HarvestRequest, HarvestTarget, HttpSource, MatchMode, RemoteFile,
    RemoteReader, RemoteSource, SourceError, SourceSettings, TakeFilter,
};
use stagehand::observability::Metrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::time::timeout;

const FILE_SIZE: u64 = 8;

/// Serves `count` files of `FILE_SIZE` bytes. Reading file `stall_on`
/// yields one chunk and then never finishes.
struct ScriptedSource {
    count: usize,
    stall_on: Option<usize>,
    stalled: Arc<Notify>,
}

struct ScriptedReader {
    chunks: Vec<Bytes>,
    stall: Option<Arc<Notify>>,
}

#[async_trait]
impl RemoteReader for ScriptedReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        if let Some(chunk) = self.chunks.pop() {
            return Ok(Some(chunk));
        }
        match self.stall.take() {
            Some(stalled) => {
                stalled.notify_one();
                std::future::pending().await
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn list(&self) -> Result<Vec<RemoteFile>, SourceError> {
        Ok((1..=self.count)
            .map(|n| RemoteFile {
                remote_ref: n.to_string(),
                name: format!("take_{n}.mov"),
                size: FILE_SIZE,
            })
            .collect())
    }

    async fn open(&self, file: &RemoteFile) -> Result<Box<dyn RemoteReader>, SourceError> {
        let n: usize = file
            .remote_ref
            .parse()
            .map_err(|_| SourceError::NotFound(file.remote_ref.clone()))?;
        if self.stall_on == Some(n) {
            return Ok(Box::new(ScriptedReader {
                chunks: vec![Bytes::from_static(b"half")],
                stall: Some(self.stalled.clone()),
            }));
        }
        Ok(Box::new(ScriptedReader {
            chunks: vec![Bytes::from_static(b"bytes"), Bytes::from_static(b"abc")],
            stall: None,
        }))
    }
}

struct BrokenListing;

#[async_trait]
impl RemoteSource for BrokenListing {
    fn describe(&self) -> String {
        "broken".to_string()
    }

    async fn list(&self) -> Result<Vec<RemoteFile>, SourceError> {
        Err(SourceError::Request("connection refused".to_string()))
    }

    async fn open(&self, file: &RemoteFile) -> Result<Box<dyn RemoteReader>, SourceError> {
        Err(SourceError::NotFound(file.name.clone()))
    }
}

fn target(id: u32, name: &str, source: Arc<dyn RemoteSource>) -> HarvestTarget {
    HarvestTarget {
        device_id: DeviceId(id),
        device_name: name.to_string(),
        source,
        formatter: NameFormatter::new(name),
    }
}

fn coordinator() -> (HarvestCoordinator, EventReceiver) {
    let (tx, rx) = events::channel();
    let coordinator = HarvestCoordinator::new(tx, Arc::new(Metrics::new()), Duration::from_secs(2));
    (coordinator, rx)
}

fn drain(rx: &mut EventReceiver) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn finished_for(events: &[Event], device: u32) -> Vec<&Event> {
    events
        .iter()
        .filter(|e| matches!(e, Event::JobFinished { device_id, .. } if *device_id == DeviceId(device)))
        .collect()
}

#[tokio::test]
async fn test_failed_listing_does_not_affect_other_device() {
    let dir = TempDir::new().unwrap();
    let (mut coordinator, mut rx) = coordinator();

    let healthy = Arc::new(ScriptedSource {
        count: 3,
        stall_on: None,
        stalled: Arc::new(Notify::new()),
    });
    coordinator
        .start(
            HarvestRequest::builder()
                .root(dir.path())
                .targets(vec![
                    target(1, "broken", Arc::new(BrokenListing)),
                    target(2, "healthy", healthy),
                ])
                .build(),
        )
        .await;

    let summary = timeout(Duration::from_secs(5), coordinator.wait()).await.unwrap();
    assert!(summary.jobs[&DeviceId(1)].error.is_some());
    assert_eq!(summary.jobs[&DeviceId(2)].counts.copied, 3);
    assert_eq!(summary.jobs[&DeviceId(2)].error, None);
    assert_eq!(summary.totals.copied, 3);

    let events = drain(&mut rx);
    assert_eq!(finished_for(&events, 1).len(), 1);
    let healthy_finish = finished_for(&events, 2);
    assert_eq!(healthy_finish.len(), 1);
    assert!(matches!(
        healthy_finish[0],
        Event::JobFinished { copied: 3, skipped: 0, failed: 0, error: None, .. }
    ));
    assert!(dir.path().join("healthy").join("take_2.mov").exists());
}

#[tokio::test]
async fn test_cancel_during_third_file() {
    let dir = TempDir::new().unwrap();
    let (mut coordinator, mut rx) = coordinator();
    let stalled = Arc::new(Notify::new());

    let source = Arc::new(ScriptedSource {
        count: 5,
        stall_on: Some(3),
        stalled: stalled.clone(),
    });
    coordinator
        .start(
            HarvestRequest::builder()
                .root(dir.path())
                .targets(vec![target(7, "deck", source)])
                .build(),
        )
        .await;

    timeout(Duration::from_secs(5), stalled.notified()).await.unwrap();
    coordinator.cancel(DeviceId(7)).await;
    let summary = coordinator.wait().await;

    let job = &summary.jobs[&DeviceId(7)];
    let statuses: Vec<FileStatus> = job.files.iter().map(|f| f.status).collect();
    assert_eq!(
        statuses,
        vec![
            FileStatus::Ok,
            FileStatus::Ok,
            FileStatus::Failed,
            FileStatus::Pending,
            FileStatus::Pending
        ]
    );
    assert_eq!(job.counts.copied, 2);
    assert!(!dir.path().join("deck").join("take_3.mov.part").exists());
    assert!(!dir.path().join("deck").join("take_3.mov").exists());

    // Cancelling again after the job finished stays silent.
    coordinator.cancel(DeviceId(7)).await;
    let events = drain(&mut rx);
    let finished = finished_for(&events, 7);
    assert_eq!(finished.len(), 1);
    assert!(matches!(finished[0], Event::JobFinished { copied: 2, .. }));
}

async fn serve_files(files: HashMap<&'static str, &'static [u8]>) -> String {
    let listing: Vec<_> = files
        .iter()
        .map(|(name, body)| json!({ "name": name, "size": body.len() }))
        .collect();
    let files = Arc::new(files);

    let app = Router::new()
        .route(
            "/files",
            get(move || {
                let listing = listing.clone();
                async move { Json(listing) }
            }),
        )
        .route(
            "/{name}",
            get(move |UrlPath(name): UrlPath<String>| {
                let files = files.clone();
                async move {
                    match files.get(name.as_str()) {
                        Some(body) => Ok(Bytes::from_static(*body)),
                        None => Err(StatusCode::NOT_FOUND),
                    }
                }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_http_harvest_filters_by_take() {
    let base = serve_files(HashMap::from([
        ("Shot-01.mov", &b"first take"[..]),
        ("shot_01.wav", &b"audio"[..]),
        ("shot_02.mov", &b"second"[..]),
    ]))
    .await;
    let source = HttpSource::new(&base, "files", SourceSettings::default()).unwrap();

    let dir = TempDir::new().unwrap();
    let (mut coordinator, _rx) = coordinator();
    coordinator
        .start(
            HarvestRequest::builder()
                .root(dir.path())
                .targets(vec![target(1, "recorder", Arc::new(source))])
                .filter(TakeFilter::takes(["shot 01"], MatchMode::StartsWith))
                .build(),
        )
        .await;
    let summary = timeout(Duration::from_secs(10), coordinator.wait()).await.unwrap();

    let job = &summary.jobs[&DeviceId(1)];
    assert_eq!(job.error, None);
    assert_eq!(job.counts.copied, 2);
    let dest = dir.path().join("recorder");
    assert_eq!(std::fs::read(dest.join("Shot-01.mov")).unwrap(), b"first take");
    assert_eq!(std::fs::read(dest.join("shot_01.wav")).unwrap(), b"audio");
    assert!(!dest.join("shot_02.mov").exists());

    // Second run finds everything in place.
    coordinator
        .start(
            HarvestRequest::builder()
                .root(dir.path())
                .targets(vec![target(
                    1,
                    "recorder",
                    Arc::new(HttpSource::new(&base, "files", SourceSettings::default()).unwrap()),
                )])
                .filter(TakeFilter::takes(["shot 01"], MatchMode::StartsWith))
                .build(),
        )
        .await;
    let summary = timeout(Duration::from_secs(10), coordinator.wait()).await.unwrap();
    assert_eq!(summary.jobs[&DeviceId(1)].counts.skipped, 2);
    assert_eq!(summary.totals.copied, 0);
}
