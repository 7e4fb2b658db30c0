//! Pulling recorded files back from devices after a session.

mod coordinator;
mod directory;
mod filter;
mod http;
mod progress;
mod source;
mod types;
mod worker;

pub use coordinator::{HarvestCoordinator, HarvestRequest, HarvestSummary, HarvestTarget};
pub use directory::DirectorySource;
pub use filter::{MatchMode, TakeFilter, normalize_name};
pub use http::HttpSource;
pub use progress::{JobProgress, ThroughputSampler, TotalsCounter};
pub use source::{
    DEFAULT_LISTING, RemoteFile, RemoteReader, RemoteSource, SourceError, SourceSettings,
    SourceSpec,
};
pub use types::{FileItem, FileStatus, JobCounts};
pub use worker::{HarvestError, JobOutcome, JobReporter};
