use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    Pending,
    Running,
    Ok,
    Skipped,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Ok | FileStatus::Skipped | FileStatus::Failed)
    }

    /// Statuses only move forward: PENDING -> RUNNING -> terminal, or
    /// PENDING -> SKIPPED.
    pub fn can_become(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Running)
                | (FileStatus::Pending, FileStatus::Skipped)
                | (FileStatus::Running, FileStatus::Ok)
                | (FileStatus::Running, FileStatus::Skipped)
                | (FileStatus::Running, FileStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "PENDING",
            FileStatus::Running => "RUNNING",
            FileStatus::Ok => "OK",
            FileStatus::Skipped => "SKIPPED",
            FileStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote file and where it lands locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileItem {
    pub remote_ref: String,
    /// Relative to the device's harvest directory
    pub local_ref: PathBuf,
    pub expected_size: u64,
    pub transferred_size: u64,
    pub status: FileStatus,
    pub error: Option<String>,
}

impl FileItem {
    pub fn new(remote_ref: impl Into<String>, local_ref: impl Into<PathBuf>, expected_size: u64) -> Self {
        Self {
            remote_ref: remote_ref.into(),
            local_ref: local_ref.into(),
            expected_size,
            transferred_size: 0,
            status: FileStatus::Pending,
            error: None,
        }
    }

    pub fn local_name(&self) -> String {
        self.local_ref.to_string_lossy().into_owned()
    }

    fn advance(&mut self, next: FileStatus) -> bool {
        if !self.status.can_become(next) {
            return false;
        }
        self.status = next;
        true
    }

    pub fn start(&mut self) -> bool {
        self.advance(FileStatus::Running)
    }

    pub fn skip(&mut self) -> bool {
        self.advance(FileStatus::Skipped)
    }

    pub fn succeed(&mut self) -> bool {
        self.advance(FileStatus::Ok)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if !self.advance(FileStatus::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }
}

/// Per-status tally, always derived from the file list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
}

impl JobCounts {
    pub fn from_files(files: &[FileItem]) -> Self {
        files.iter().fold(Self::default(), |mut counts, file| {
            match file.status {
                FileStatus::Ok => counts.copied += 1,
                FileStatus::Skipped => counts.skipped += 1,
                FileStatus::Failed => counts.failed += 1,
                FileStatus::Pending | FileStatus::Running => counts.pending += 1,
            }
            counts
        })
    }

    pub fn add(&mut self, other: JobCounts) {
        self.copied += other.copied;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.pending += other.pending;
    }
}
