pub mod auth;
pub mod check_runs;
pub mod circuit;
pub mod client;
pub mod error;
pub mod pagination;
pub mod rate_limit;

pub use auth::{AppAuth, AuthToken, Authenticator};
pub use check_runs::{CheckConclusion, CheckRun, CheckRunOutput, CheckStatus};
pub use circuit::{CircuitBreaker, CircuitState};
pub use client::{ClientConfig, DEFAULT_API_URL, GithubClient};
pub use error::{GithubError, Result};
pub use pagination::{LinkHeader, Page, Paginator};
pub use rate_limit::{RateLimit, RateLimiter};

pub type UserId = u64;
pub type PullRequestNumber = u64;

#[derive(Debug, PartialEq, Eq, serde::Deserialize, Clone)]
pub struct User {
    pub login: String,
    pub id: UserId,
}

#[derive(Debug, serde::Deserialize, Clone)]
pub struct Repository {
    /// `owner/name`.
    pub full_name: String,
    pub default_branch: String,
    #[serde(default)]
    pub fork: bool,
}

impl Repository {
    pub fn owner(&self) -> &str {
        self.full_name.split_once('/').map(|(o, _)| o).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.full_name.split_once('/').map(|(_, n)| n).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullRequestState {
    Open,
    Closed,
}

/// One end of a pull request (its head or base).
#[derive(Debug, serde::Deserialize, Clone)]
pub struct CommitRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, serde::Deserialize, Clone)]
pub struct PullRequest {
    pub number: PullRequestNumber,
    pub title: String,
    pub state: PullRequestState,
    #[serde(default)]
    pub draft: bool,
    pub head: CommitRef,
    pub base: CommitRef,
}
