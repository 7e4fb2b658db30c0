//! HTTP file server exposed by a recorder.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use std::future::Future;
use tracing::{debug, warn};

use super::source::{RemoteFile, RemoteReader, RemoteSource, Result, SourceError, SourceSettings};

#[derive(Debug, Deserialize)]
struct ListingEntry {
    name: String,
    #[serde(default)]
    size: u64,
}

/// `GET {base}/{listing}` returns `[{"name": .., "size": ..}]`; each file is
/// fetched from `GET {base}/{name}`.
pub struct HttpSource {
    client: Client,
    base: Url,
    listing: String,
    settings: SourceSettings,
}

impl HttpSource {
    pub fn new(base_url: &str, listing: &str, settings: SourceSettings) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| SourceError::Request(format!("Invalid URL {base_url}: {e}")))?;
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.request_timeout)
            .user_agent(concat!("stagehand/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| SourceError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base,
            listing: listing.to_string(),
            settings,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Request(format!("{} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(path.split('/').filter(|segment| !segment.is_empty()));
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<Response> {
        let response = self.client.get(url).send().await.map_err(map_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(response.url().path().to_string()));
        }
        if !status.is_success() {
            return Err(SourceError::Request(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }
        Ok(response)
    }

    /// Retry idempotent requests with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut attempt_once: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match attempt_once().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(what, attempts, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(SourceError::NotFound(path)) => return Err(SourceError::NotFound(path)),
                Err(e) if attempts >= self.settings.max_retries.max(1) => {
                    warn!(what, attempts, error = %e, "Request failed after retries");
                    return Err(e);
                }
                Err(e) => {
                    warn!(what, attempts, error = %e, "Request failed, retrying");
                    let backoff = self.settings.retry_backoff * 2u32.pow(attempts - 1);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn map_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout
    } else if e.is_decode() {
        SourceError::Listing(e.to_string())
    } else {
        SourceError::Request(e.to_string())
    }
}

struct HttpReader {
    response: Response,
}

#[async_trait]
impl RemoteReader for HttpReader {
    fn size_hint(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(map_error)
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn describe(&self) -> String {
        self.base.to_string()
    }

    async fn list(&self) -> Result<Vec<RemoteFile>> {
        let url = self.url(&self.listing)?;
        let target = &url;
        let entries: Vec<ListingEntry> = self
            .with_retry("list", move || async move {
                let response = self.get(target.clone()).await?;
                response.json().await.map_err(map_error)
            })
            .await?;

        debug!(url = %url, files = entries.len(), "Listed remote files");
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.name.is_empty())
            .map(|entry| RemoteFile {
                remote_ref: entry.name.clone(),
                name: entry.name,
                size: entry.size,
            })
            .collect())
    }

    async fn open(&self, file: &RemoteFile) -> Result<Box<dyn RemoteReader>> {
        let url = self.url(&file.remote_ref)?;
        let target = &url;
        let response = self
            .with_retry("download", move || self.get(target.clone()))
            .await?;
        Ok(Box::new(HttpReader { response }))
    }
}
