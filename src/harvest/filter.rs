//! Take-list matching for harvested file names.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::device::NameFormatter;

/// Lowercase, with `-` and spaces folded to `_`.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    #[default]
    StartsWith,
    Contains,
}

impl MatchMode {
    fn matches(self, stem: &str, take: &str) -> bool {
        match self {
            MatchMode::Exact => stem == take,
            MatchMode::StartsWith => stem.starts_with(take),
            MatchMode::Contains => stem.contains(take),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TakeFilter {
    #[default]
    All,
    Takes { takes: Vec<String>, mode: MatchMode },
}

impl TakeFilter {
    pub fn takes(takes: impl IntoIterator<Item = impl Into<String>>, mode: MatchMode) -> Self {
        TakeFilter::Takes {
            takes: takes.into_iter().map(Into::into).collect(),
            mode,
        }
    }

    /// Whether `file_name` belongs to one of the takes as this device names
    /// them.
    pub fn matches(&self, file_name: &str, formatter: &NameFormatter) -> bool {
        let TakeFilter::Takes { takes, mode } = self else {
            return true;
        };
        let base = Path::new(file_name)
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        let stem = normalize_name(base.split('.').next().unwrap_or_default());

        takes
            .iter()
            .map(|take| normalize_name(&formatter.format_take(take)))
            .filter(|take| !take.is_empty())
            .any(|take| mode.matches(&stem, &take))
    }
}
