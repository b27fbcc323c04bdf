//! Batch check-run discovery for pull requests.
//!
//! The monitor hands over the PR stubs it found for one repository; this
//! module fans out to the check-runs endpoint once per unique head commit,
//! caches per-commit results, and maps the runs back onto every PR. Two
//! PRs pointing at the same commit cost one API round-trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing as log;
use url::Url;

use crate::cache::Cache;
use crate::decode;
use crate::github::check_runs::CheckRun;
use crate::github::error::{GithubError, Result};
use crate::github::{GithubClient, PullRequestNumber};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// How long a fetched check-run list stays cached.
const CHECKS_TTL: Duration = Duration::from_secs(300);
/// Shorter TTL for a commit the server knows nothing about, so a check
/// suite that appears moments later is picked up quickly.
const NO_CHECKS_TTL: Duration = Duration::from_secs(60);
/// Pause between fan-out batches.
const BATCH_PAUSE: Duration = Duration::from_millis(100);
/// Check-run listings are bounded; five 100-item pages is plenty.
const CHECKS_PAGE_CAP: u32 = 5;

/// The minimal pull-request descriptor the discoverer consumes. The full
/// PR record lives with the discovery engine; only these fields cross the
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStub {
    /// Opaque identifier of the owning pull request.
    pub id: String,
    pub number: PullRequestNumber,
    /// SHA of the PR's head commit.
    pub head_sha: String,
}

/// Extract `(owner, name)` from a repository URL, tolerating a trailing
/// `.git`.
pub fn parse_repository_url(repository_url: &str) -> Result<(String, String)> {
    let parsed = Url::parse(repository_url).map_err(|e| {
        GithubError::validation(format!(
            "failed to parse repository URL {repository_url:?}: {e}"
        ))
    })?;
    let mut segments = parsed
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty());
    let (Some(owner), Some(name)) = (segments.next(), segments.next()) else {
        return Err(GithubError::validation(format!(
            "invalid repository URL {repository_url:?}: expected /owner/name"
        )));
    };
    let name = name.strip_suffix(".git").unwrap_or(name);
    Ok((owner.to_string(), name.to_string()))
}

pub struct CheckDiscoverer {
    client: Arc<GithubClient>,
    cache: Arc<dyn Cache>,
    batch_size: usize,
    semaphore: Semaphore,
}

impl CheckDiscoverer {
    pub fn new(client: Arc<GithubClient>, cache: Arc<dyn Cache>) -> Self {
        CheckDiscoverer::with_limits(client, cache, DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENT)
    }

    pub fn with_limits(
        client: Arc<GithubClient>,
        cache: Arc<dyn Cache>,
        batch_size: usize,
        max_concurrent: usize,
    ) -> Self {
        CheckDiscoverer {
            client,
            cache,
            batch_size: batch_size.max(1),
            semaphore: Semaphore::new(max_concurrent.max(1)),
        }
    }

    fn cache_key(owner: &str, repo: &str, sha: &str) -> String {
        format!("checks:{owner}:{repo}:{sha}")
    }

    /// Check runs for a single PR's head commit. Failures are logged and
    /// collapse to an empty list; the next discovery cycle retries.
    pub async fn discover_checks(&self, pr: &PrStub, repository_url: &str) -> Vec<CheckRun> {
        let (owner, repo) = match parse_repository_url(repository_url) {
            Ok(coordinate) => coordinate,
            Err(e) => {
                log::error!("error discovering checks for PR #{}: {e}", pr.number);
                return Vec::new();
            }
        };
        match self
            .fetch_checks_for_sha(&owner, &repo, &pr.head_sha)
            .await
        {
            Ok(runs) => {
                log::debug!("discovered {} check runs for PR #{}", runs.len(), pr.number);
                runs
            }
            Err(e) => {
                log::error!("error discovering checks for PR #{}: {e}", pr.number);
                Vec::new()
            }
        }
    }

    /// Check runs for a set of PRs from one repository, deduplicated by
    /// head SHA.
    ///
    /// Every input stub appears as a key of the result; stubs sharing a
    /// SHA get equal but independently owned lists. Rate-limit errors
    /// abort the batch and propagate so the caller can honour the reset;
    /// any other per-SHA failure is logged and maps to an empty list.
    pub async fn batch_discover_checks(
        &self,
        prs: &[PrStub],
        repository_url: &str,
    ) -> Result<HashMap<PullRequestNumber, Vec<CheckRun>>> {
        if prs.is_empty() {
            return Ok(HashMap::new());
        }
        let (owner, repo) = parse_repository_url(repository_url)?;

        // Group PRs by head SHA; each group costs one fetch.
        let mut groups: Vec<(String, Vec<PullRequestNumber>)> = Vec::new();
        for pr in prs {
            match groups.iter_mut().find(|(sha, _)| *sha == pr.head_sha) {
                Some((_, numbers)) => numbers.push(pr.number),
                None => groups.push((pr.head_sha.clone(), vec![pr.number])),
            }
        }
        log::info!(
            "batch discovering checks for {} PRs ({} unique SHAs) from {owner}/{repo}",
            prs.len(),
            groups.len()
        );

        let mut sha_to_checks: HashMap<&str, Vec<CheckRun>> = HashMap::new();
        for (index, batch) in groups.chunks(self.batch_size).enumerate() {
            let fetches = batch.iter().map(|(sha, _)| {
                let owner = owner.as_str();
                let repo = repo.as_str();
                async move { (sha.as_str(), self.fetch_checks_for_sha(owner, repo, sha).await) }
            });
            for (sha, outcome) in futures::future::join_all(fetches).await {
                match outcome {
                    Ok(runs) => {
                        sha_to_checks.insert(sha, runs);
                    }
                    Err(e) if e.is_rate_limit() => return Err(e),
                    Err(e) => {
                        log::warn!("error fetching checks for SHA {sha}: {e}");
                        sha_to_checks.insert(sha, Vec::new());
                    }
                }
            }
            if (index + 1) * self.batch_size < groups.len() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        let mut result = HashMap::new();
        for (sha, numbers) in &groups {
            let runs = sha_to_checks.get(sha.as_str()).cloned().unwrap_or_default();
            for number in numbers {
                // Clone per PR so callers sharing a SHA never alias.
                result.insert(*number, runs.clone());
            }
        }
        Ok(result)
    }

    /// Check runs for one commit, consulting the cache first.
    ///
    /// A fetched list is cached for five minutes; a 404 caches an empty
    /// list for one minute. Rate-limit errors propagate. Any other API
    /// error yields whatever was gathered before it, uncached, so the
    /// next cycle retries.
    async fn fetch_checks_for_sha(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<CheckRun>> {
        let key = CheckDiscoverer::cache_key(owner, repo, sha);
        if let Some(cached) = self.cache.get(&key).await {
            match decode::<Vec<CheckRun>>(cached) {
                Ok(runs) => {
                    log::debug!("cache hit for check runs: {key}");
                    return Ok(runs);
                }
                Err(e) => log::warn!("discarding undecodable cache entry {key}: {e}"),
            }
        }

        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| GithubError::connection("discovery semaphore closed"))?;
        log::debug!("fetching check runs for {owner}/{repo}@{sha}");
        let mut runs = Vec::new();
        let outcome = self.fetch_pages(owner, repo, sha, &mut runs).await;
        drop(permit);

        match outcome {
            Ok(()) => {
                if let Ok(value) = serde_json::to_value(&runs) {
                    self.cache.set(&key, value, CHECKS_TTL).await;
                }
                log::debug!("found {} check runs for {owner}/{repo}@{sha}", runs.len());
                Ok(runs)
            }
            Err(e) if e.is_not_found() => {
                log::debug!("no check runs found for {owner}/{repo}@{sha}");
                self.cache.set(&key, Value::Array(Vec::new()), NO_CHECKS_TTL).await;
                Ok(Vec::new())
            }
            Err(e) if e.is_rate_limit() => {
                log::warn!("rate limit hit while fetching checks for {sha}: {e}");
                Err(e)
            }
            Err(e) => {
                log::warn!("github api error fetching checks for {sha}: {e}");
                Ok(runs)
            }
        }
    }

    async fn fetch_pages(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        runs: &mut Vec<CheckRun>,
    ) -> Result<()> {
        let mut paginator = self.client.paginate(
            &format!("/repos/{owner}/{repo}/commits/{sha}/check-runs"),
            None,
            100,
            Some(CHECKS_PAGE_CAP),
        )?;
        while let Some(page) = paginator.next_page().await? {
            let entries = page
                .body
                .get("check_runs")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for entry in entries {
                let id = entry.get("id").cloned();
                match CheckRun::from_api(entry) {
                    Ok(run) => runs.push(run),
                    Err(e) => log::warn!("failed to convert check run {id:?}: {e}"),
                }
            }
        }
        Ok(())
    }
}
