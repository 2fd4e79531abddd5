use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Smallest accepted interval between two runs of a task (seconds).
pub const MIN_INTERVAL_SECS: i64 = 1;
/// Largest interval accepted when a task is added (seconds, one day).
pub const MAX_INTERVAL_SECS: i64 = 86_400;
/// Longest accepted description, in characters.
pub const MAX_DESCRIPTION_LEN: usize = 200;

/// HTTP method a task is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`, always sent without a body.
    Post,
}

impl Method {
    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ValidationError;

    /// Trims and upper-cases before matching, so `" get "` is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            _ => Err(ValidationError::Method(s.to_string())),
        }
    }
}

/// Reasons an add request is rejected before any state changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Method other than GET/POST.
    #[error("method must be GET or POST (got {0:?})")]
    Method(String),
    /// Interval outside `MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS`.
    #[error("interval_seconds must be between 1 and 86400 (got {0})")]
    Interval(i64),
    /// URL missing, unparsable or not http(s).
    #[error("url must be an absolute http or https URL (got {0:?})")]
    Url(String),
    /// Description empty after trimming, or too long.
    #[error("description must be 1 to 200 characters")]
    Description,
}

/// Body of an add request, as received from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Seconds between two runs.
    pub interval_seconds: i64,
    /// Target URL.
    pub url: String,
    /// "GET" or "POST", any case.
    pub method: String,
    /// Free-form label.
    pub description: String,
}

impl NewTask {
    /// Check every field and produce the normalized definition.
    pub fn validate(&self) -> Result<TaskSpec, ValidationError> {
        let method: Method = self.method.parse()?;

        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.interval_seconds) {
            return Err(ValidationError::Interval(self.interval_seconds));
        }

        let url = self.url.trim();
        match Url::parse(url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") && u.has_host() => {}
            _ => return Err(ValidationError::Url(self.url.clone())),
        }

        let description = self.description.trim();
        let len = description.chars().count();
        if len == 0 || len > MAX_DESCRIPTION_LEN {
            return Err(ValidationError::Description);
        }

        Ok(TaskSpec {
            interval_seconds: self.interval_seconds as u64,
            url: url.to_string(),
            method,
            description: description.to_string(),
        })
    }
}

/// Immutable definition of a task once it has been accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Seconds between two runs, at least 1.
    pub interval_seconds: u64,
    /// Target URL.
    pub url: String,
    /// Normalized method.
    pub method: Method,
    /// Trimmed description.
    pub description: String,
}

/// Whether a task currently has an execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// A loop is active.
    Running,
    /// Paused for good; only removal is possible.
    Paused,
}

/// Read-only view of a task handed out by list/get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    /// Task identifier.
    pub id: String,
    /// Seconds between runs.
    pub interval_seconds: u64,
    /// Target URL.
    pub url: String,
    /// Method used for each call.
    pub method: Method,
    /// Description given at creation.
    pub description: String,
    /// Running or paused.
    pub status: TaskStatus,
    /// Attempts completed so far in this process.
    pub run_count: u64,
}
