//! Where a device's recordings can be listed and read from.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::directory::DirectorySource;
use super::http::HttpSource;
use crate::device::{DeviceConfig, DeviceConfigError};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out")]
    Timeout,

    #[error("malformed listing: {0}")]
    Listing(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// One file as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Opaque locator passed back to [`RemoteSource::open`]
    pub remote_ref: String,
    /// Path relative to the device's harvest directory, `/` separated
    pub name: String,
    pub size: u64,
}

#[async_trait]
pub trait RemoteReader: Send {
    /// Size announced by the transfer itself, if any.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Next chunk, or `None` at end of stream.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn describe(&self) -> String;

    async fn list(&self) -> Result<Vec<RemoteFile>>;

    async fn open(&self, file: &RemoteFile) -> Result<Box<dyn RemoteReader>>;
}

/// Transfer tuning shared by every source.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Harvest location configured on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Http { base_url: String, listing: String },
    Directory(PathBuf),
}

pub const DEFAULT_LISTING: &str = "files";

impl SourceSpec {
    /// Read `harvest_url`/`harvest_listing` or `harvest_dir`. Neither is fine.
    pub fn from_config(config: &DeviceConfig) -> std::result::Result<Option<Self>, DeviceConfigError> {
        let url = config.opt_str("harvest_url")?;
        let dir = config.opt_str("harvest_dir")?;
        match (url, dir) {
            (Some(_), Some(_)) => Err(DeviceConfigError::Invalid {
                field: "harvest_dir",
                reason: "cannot be combined with harvest_url".to_string(),
            }),
            (Some(url), None) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(DeviceConfigError::Invalid {
                        field: "harvest_url",
                        reason: format!("'{url}' is not an http(s) url"),
                    });
                }
                Ok(Some(SourceSpec::Http {
                    base_url: url.trim_end_matches('/').to_string(),
                    listing: config
                        .opt_str("harvest_listing")?
                        .unwrap_or_else(|| DEFAULT_LISTING.to_string()),
                }))
            }
            (None, Some(dir)) => Ok(Some(SourceSpec::Directory(PathBuf::from(dir)))),
            (None, None) => Ok(None),
        }
    }

    pub fn write_config(&self, config: &mut DeviceConfig) {
        match self {
            SourceSpec::Http { base_url, listing } => {
                config.insert("harvest_url", base_url.clone());
                if listing != DEFAULT_LISTING {
                    config.insert("harvest_listing", listing.clone());
                }
            }
            SourceSpec::Directory(dir) => {
                config.insert("harvest_dir", dir.to_string_lossy().into_owned());
            }
        }
    }

    pub fn build(&self, settings: &SourceSettings) -> Result<Arc<dyn RemoteSource>> {
        Ok(match self {
            SourceSpec::Http { base_url, listing } => {
                Arc::new(HttpSource::new(base_url, listing, settings.clone())?)
            }
            SourceSpec::Directory(dir) => Arc::new(DirectorySource::new(dir, settings.chunk_size)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_config() {
        let http = DeviceConfig::new().with("harvest_url", "http://10.0.0.2:8080/");
        assert_eq!(
            SourceSpec::from_config(&http).unwrap(),
            Some(SourceSpec::Http {
                base_url: "http://10.0.0.2:8080".to_string(),
                listing: DEFAULT_LISTING.to_string(),
            })
        );

        let dir = DeviceConfig::new().with("harvest_dir", "/mnt/cam");
        let spec = SourceSpec::from_config(&dir).unwrap().unwrap();
        let mut written = DeviceConfig::new();
        spec.write_config(&mut written);
        assert_eq!(written, dir);

        assert_eq!(SourceSpec::from_config(&DeviceConfig::new()).unwrap(), None);
    }

    #[test]
    fn test_spec_rejects_conflicts_and_bad_urls() {
        let both = DeviceConfig::new()
            .with("harvest_url", "http://a")
            .with("harvest_dir", "/b");
        assert!(SourceSpec::from_config(&both).is_err());
        let ftp = DeviceConfig::new().with("harvest_url", "ftp://a");
        assert!(SourceSpec::from_config(&ftp).is_err());
    }
}
