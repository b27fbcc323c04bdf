//! Check runs as reported against a commit.
//!
//! [`CheckRun`] is the crate's own shape, decoupled from the wire payload
//! so it can be cached and handed to the discovery engine as plain
//! structured data.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::decode;
use crate::github::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
    Waiting,
    Requested,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    ActionRequired,
    Cancelled,
    Failure,
    Neutral,
    Skipped,
    Stale,
    Success,
    TimedOut,
}

/// Output block attached to a check run, when the reporter provided one.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CheckRunOutput {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub text: Option<String>,
    #[serde(default)]
    pub annotations_count: u64,
    pub annotations_url: Option<String>,
}

/// A single automated check reported against a commit.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckRun {
    /// The server's id for this run, stringified.
    pub external_id: String,
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub details_url: Option<String>,
    pub output: Option<CheckRunOutput>,
}

// Wire shape of one entry in the `check_runs` array.
#[derive(Debug, serde::Deserialize)]
struct ApiCheckRun {
    id: u64,
    name: String,
    status: CheckStatus,
    #[serde(default)]
    conclusion: Option<CheckConclusion>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    details_url: Option<String>,
    #[serde(default)]
    output: Option<CheckRunOutput>,
}

impl CheckRun {
    /// Convert one entry of a check-runs response body.
    pub fn from_api(value: Value) -> Result<CheckRun> {
        let api: ApiCheckRun = decode(value)?;
        Ok(CheckRun {
            external_id: api.id.to_string(),
            name: api.name,
            status: api.status,
            conclusion: api.conclusion,
            started_at: api.started_at,
            completed_at: api.completed_at,
            details_url: api.details_url,
            output: api.output,
        })
    }

    pub fn is_completed(&self) -> bool {
        self.status == CheckStatus::Completed
    }
}
