use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Placeholder replaced by the commit sha in a project's `url_pattern`.
pub const COMMIT_PLACEHOLDER: &str = "%commit%";

/// A registered buildable unit bound to one repository, branch and command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub slug: String,
    pub name: String,
    pub repository: String,
    pub branch: String,
    pub command: String,
    pub url_pattern: Option<String>,
}

impl Project {
    /// Link to the commit in an external viewer, if the project has a pattern.
    pub fn commit_url(&self, sha: &str) -> Option<String> {
        self.url_pattern
            .as_ref()
            .map(|pattern| pattern.replace(COMMIT_PLACEHOLDER, sha))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatus {
    Unknown,
    Building,
    Passed,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Building => "building",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed)
    }
}

impl std::fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "building" => Ok(Self::Building),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid commit status: {}", s)),
        }
    }
}

/// Version-control metadata for a commit discovered on the watched branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub author: String,
}

/// One build attempt record, keyed by `(slug, sha)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub slug: String,
    pub sha: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub author: String,
    pub status: CommitStatus,
    pub output: Vec<u8>,
    pub build_date: DateTime<Utc>,
}

impl Commit {
    pub fn short_sha(&self) -> &str {
        short_sha(&self.sha)
    }

    /// Build output decoded for display. Invalid UTF-8 is replaced.
    pub fn output_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }

    /// First line of the commit message.
    pub fn title(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim()
    }
}

/// Sort direction for commit listings, applied to `build_date`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

/// Convert a display name to a slug usable as a key and directory name.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        Project {
            slug: "app".into(),
            name: "App".into(),
            repository: "https://example.com/app.git".into(),
            branch: "main".into(),
            command: "make test".into(),
            url_pattern: Some("https://example.com/app/commit/%commit%".into()),
        }
    }

    #[test]
    fn test_commit_url_substitutes_sha() {
        let url = project().commit_url("abc123");
        assert_eq!(
            url.as_deref(),
            Some("https://example.com/app/commit/abc123")
        );
    }

    #[test]
    fn test_commit_url_without_pattern() {
        let mut p = project();
        p.url_pattern = None;
        assert!(p.commit_url("abc123").is_none());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            CommitStatus::Unknown,
            CommitStatus::Building,
            CommitStatus::Passed,
            CommitStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CommitStatus>(), Ok(status));
        }
        assert!("done".parse::<CommitStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_as_stored_string() {
        assert_eq!(
            serde_json::to_string(&CommitStatus::Passed).unwrap(),
            "\"passed\""
        );
        assert_eq!(
            serde_json::to_value(CommitStatus::Building).unwrap(),
            serde_json::Value::from(CommitStatus::Building.as_str())
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(CommitStatus::Passed.is_terminal());
        assert!(CommitStatus::Failed.is_terminal());
        assert!(!CommitStatus::Building.is_terminal());
        assert!(!CommitStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Great App"), "my-great-app");
        assert_eq!(slugify("  Symfony 2.x (dev) "), "symfony-2-x-dev");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("0123456789abcdef"), "0123456");
        assert_eq!(short_sha("abc"), "abc");
    }
}
