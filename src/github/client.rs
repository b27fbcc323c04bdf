//! The GitHub API client and its request pipeline.
//!
//! Every call funnels through [`GithubClient::request`]: circuit-breaker
//! gate, rate-limit gate, credential injection, a process-wide in-flight
//! semaphore, dispatch, header-driven rate-limit bookkeeping, response
//! classification, and bounded retry with exponential backoff. The
//! higher-level helpers (`get`/`post`/`put`/`delete`, pagination,
//! convenience endpoints) are thin wrappers over that one path.

use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing as log;
use url::Url;
use uuid::Uuid;

use crate::decode;
use crate::github::auth::Authenticator;
use crate::github::circuit::CircuitBreaker;
use crate::github::error::{GithubError, Result};
use crate::github::pagination::{Page, Paginator};
use crate::github::rate_limit::{DEFAULT_RATE_LIMIT_BUFFER, RateLimiter, header_u64};
use crate::github::{PullRequest, PullRequestNumber, Repository, User};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Upper bound on a single inter-retry sleep, whatever the configured
/// backoff base works out to.
const MAX_RETRY_BACKOFF_SECS: f64 = 3600.0;

/// Client configuration. Immutable after construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Total per-request timeout, including connect and body read.
    pub timeout: Duration,
    /// Retries on top of the initial attempt for transport failures,
    /// timeouts and 5xx responses.
    pub max_retries: u32,
    /// Inter-retry sleep is `retry_backoff_base ^ attempt` seconds.
    pub retry_backoff_base: f64,
    /// Remaining-quota margin below which the governor refuses dispatch.
    pub rate_limit_buffer: u64,
    pub user_agent: String,
    pub max_concurrent_requests: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff_base: 2.0,
            rate_limit_buffer: DEFAULT_RATE_LIMIT_BUFFER,
            user_agent: concat!("checkwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            max_concurrent_requests: 10,
        }
    }
}

struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Debug)]
pub struct GithubClient {
    auth: Authenticator,
    config: ClientConfig,
    base_url: Url,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    /// Lazily built transport. `close` drops it; the next call re-builds.
    http: RwLock<Option<reqwest::Client>>,
    semaphore: Semaphore,
}

impl GithubClient {
    pub fn new(auth: Authenticator, config: ClientConfig) -> Result<Self> {
        GithubClient::with_breaker(auth, config, CircuitBreaker::default())
    }

    /// Like [`GithubClient::new`] with a caller-supplied breaker, for
    /// non-default thresholds.
    pub fn with_breaker(
        auth: Authenticator,
        config: ClientConfig,
        circuit_breaker: CircuitBreaker,
    ) -> Result<Self> {
        if !(config.retry_backoff_base.is_finite() && config.retry_backoff_base >= 0.0) {
            return Err(GithubError::validation(
                "retry_backoff_base must be a non-negative finite number",
            ));
        }
        if config.max_concurrent_requests == 0 {
            return Err(GithubError::validation(
                "max_concurrent_requests must be at least 1",
            ));
        }
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| {
            GithubError::validation(format!("invalid base url {:?}: {e}", config.base_url))
        })?;
        Ok(GithubClient {
            rate_limiter: RateLimiter::new(config.rate_limit_buffer),
            semaphore: Semaphore::new(config.max_concurrent_requests),
            http: RwLock::new(None),
            auth,
            base_url,
            config,
            circuit_breaker,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Drop the transport and its connection pool. The client stays
    /// usable; the next request re-initialises the pool on demand.
    /// Dropping the client itself releases the pool on every exit path.
    pub fn close(&self) {
        let mut slot = self.http.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    /// The shared transport, built on first use. The fast path is a read
    /// lock and a cheap handle clone; initialisation is double-checked so
    /// concurrent first calls build the pool at most once.
    fn http(&self) -> Result<reqwest::Client> {
        {
            let slot = self.http.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(client) = slot.as_ref() {
                return Ok(client.clone());
            }
        }
        let mut slot = self.http.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github.v3+json"),
        );
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| GithubError::connection(format!("failed to initialise transport: {e}")))?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Resolve a path against the configured base URL. Absolute URLs pass
    /// through; leading slashes on relative paths are tolerated, so
    /// `user` and `/user` name the same resource.
    fn resolve(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|e| GithubError::validation(format!("invalid url {path:?}: {e}")));
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| GithubError::validation(format!("invalid path {path:?}: {e}")))
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        params: Option<&[(String, String)]>,
        body: Option<&Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<ApiResponse> {
        let correlation = correlation_id();
        let http = self.http()?;

        let mut builder = http.request(method.clone(), url.clone());
        if let Some(params) = params
            && !params.is_empty()
        {
            builder = builder.query(params);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(headers) = extra_headers {
            builder = builder.headers(headers);
        }
        let request = builder.build().map_err(|e| {
            GithubError::validation(format!("failed to build request for {url}: {e}"))
        })?;

        let mut last_error: Option<GithubError> = None;
        for attempt in 0..=self.config.max_retries {
            // Every attempt re-runs the gates so the breaker and the
            // governor get a fresh say.
            if !self.circuit_breaker.can_attempt() {
                return Err(GithubError::connection(format!(
                    "circuit breaker open, wait {:.1}s before retry",
                    self.circuit_breaker.wait_duration().as_secs_f64()
                )));
            }
            self.rate_limiter.check("core")?;
            let token = self.auth.token().await?;

            let permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| GithubError::connection("request semaphore closed"))?;

            let mut attempt_request = request
                .try_clone()
                .ok_or_else(|| GithubError::connection("request body cannot be replayed"))?;
            let mut auth_value = HeaderValue::from_str(&token.header_value()).map_err(|e| {
                GithubError::authentication(format!("credential is not a valid header value: {e}"))
            })?;
            auth_value.set_sensitive(true);
            attempt_request
                .headers_mut()
                .insert(AUTHORIZATION, auth_value);

            log::debug!(
                "github request [{correlation}] {method} {url} (attempt {})",
                attempt + 1
            );
            let started = Instant::now();
            match http.execute(attempt_request).await {
                Ok(response) => {
                    let status = response.status();
                    self.rate_limiter.update_from_headers(response.headers());
                    log::debug!(
                        "github response [{correlation}] {} in {:.2}s",
                        status.as_u16(),
                        started.elapsed().as_secs_f64()
                    );
                    if matches!(
                        status,
                        StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT
                    ) {
                        self.circuit_breaker.record_success();
                        let headers = response.headers().clone();
                        let body = response.bytes().await.map_err(|e| {
                            GithubError::connection(format!("failed to read response body: {e}"))
                        })?;
                        return Ok(ApiResponse {
                            status,
                            headers,
                            body,
                        });
                    }
                    let error = self.error_from_response(response, &correlation).await;
                    if error.is_server() {
                        self.circuit_breaker.record_failure();
                        last_error = Some(error);
                    } else {
                        return Err(error);
                    }
                }
                Err(e) if e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(GithubError::timeout(format!(
                        "request timeout for {method} {url}"
                    )));
                }
                Err(e) => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(GithubError::connection(format!(
                        "connection error for {method} {url}: {e}"
                    )));
                }
            }
            // Release the in-flight slot before sleeping out the backoff.
            drop(permit);

            if attempt < self.config.max_retries {
                let backoff = self
                    .config
                    .retry_backoff_base
                    .powi(attempt as i32)
                    .min(MAX_RETRY_BACKOFF_SECS);
                if let Some(error) = &last_error {
                    log::warn!(
                        "github request [{correlation}] failed (attempt {}), retrying in {backoff:.1}s: {error}",
                        attempt + 1
                    );
                }
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GithubError::api(format!(
                "request failed after {} retries",
                self.config.max_retries
            ))
        }))
    }

    async fn error_from_response(
        &self,
        response: reqwest::Response,
        correlation: &str,
    ) -> GithubError {
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.unwrap_or_default();
        let body: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({ "message": text }));
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        log::warn!(
            "github api error [{correlation}] {}: {message}",
            status.as_u16()
        );

        let code = status.as_u16();
        match code {
            401 => GithubError::Authentication {
                message,
                status: Some(code),
                body: Some(body),
            },
            403 if message.to_ascii_lowercase().contains("rate limit") => GithubError::RateLimit {
                message,
                reset: header_u64(&headers, "x-ratelimit-reset"),
                remaining: header_u64(&headers, "x-ratelimit-remaining").unwrap_or(0),
                limit: header_u64(&headers, "x-ratelimit-limit").unwrap_or(0),
            },
            403 => GithubError::Authentication {
                message,
                status: Some(code),
                body: Some(body),
            },
            404 => GithubError::NotFound {
                message,
                status: Some(code),
                body: Some(body),
            },
            422 => GithubError::Validation {
                message,
                status: Some(code),
                body: Some(body),
            },
            500..=599 => GithubError::Server {
                message,
                status: code,
                body: Some(body),
            },
            _ => GithubError::Api {
                message,
                status: Some(code),
                body: Some(body),
            },
        }
    }

    pub async fn get(
        &self,
        path: &str,
        params: Option<&[(String, String)]>,
        headers: Option<HeaderMap>,
    ) -> Result<Value> {
        let url = self.resolve(path)?;
        let response = self.request(Method::GET, url, params, None, headers).await?;
        json_body(&response)
    }

    pub async fn post(
        &self,
        path: &str,
        body: Option<&Value>,
        params: Option<&[(String, String)]>,
        headers: Option<HeaderMap>,
    ) -> Result<Value> {
        let url = self.resolve(path)?;
        let response = self
            .request(Method::POST, url, params, body, headers)
            .await?;
        json_body(&response)
    }

    pub async fn put(
        &self,
        path: &str,
        body: Option<&Value>,
        params: Option<&[(String, String)]>,
        headers: Option<HeaderMap>,
    ) -> Result<Value> {
        let url = self.resolve(path)?;
        let response = self.request(Method::PUT, url, params, body, headers).await?;
        json_body(&response)
    }

    /// Returns `None` for a 204 response, the decoded body otherwise.
    pub async fn delete(
        &self,
        path: &str,
        params: Option<&[(String, String)]>,
        headers: Option<HeaderMap>,
    ) -> Result<Option<Value>> {
        let url = self.resolve(path)?;
        let response = self
            .request(Method::DELETE, url, params, None, headers)
            .await?;
        if response.status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        json_body(&response).map(Some)
    }

    /// Fetch one page for the paginator.
    pub(crate) async fn fetch_page(
        &self,
        url: Url,
        params: Option<&[(String, String)]>,
    ) -> Result<Page> {
        let response = self
            .request(Method::GET, url.clone(), params, None, None)
            .await?;
        let body = json_body(&response)?;
        Ok(Page::new(body, response.headers, url))
    }

    /// Lazy cursor over a paginated collection rooted at `path`.
    pub fn paginate(
        &self,
        path: &str,
        params: Option<&[(String, String)]>,
        per_page: u32,
        max_pages: Option<u32>,
    ) -> Result<Paginator<'_>> {
        let url = self.resolve(path)?;
        Ok(Paginator::new(self, url, params, per_page, max_pages))
    }
}

// Convenience endpoints

impl GithubClient {
    /// The authenticated user.
    pub async fn get_user(&self) -> Result<User> {
        decode(self.get("/user", None, None).await?)
    }

    /// Information about a repository.
    pub async fn get_repository(&self, owner: &str, repo: &str) -> Result<Repository> {
        decode(self.get(&format!("/repos/{owner}/{repo}"), None, None).await?)
    }

    /// Pull requests of a repository, one page fetch at a time.
    pub fn list_pulls(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
        per_page: u32,
    ) -> Result<Paginator<'_>> {
        let params = [("state".to_string(), state.to_string())];
        self.paginate(
            &format!("/repos/{owner}/{repo}/pulls"),
            Some(&params),
            per_page,
            None,
        )
    }

    /// A single pull request.
    pub async fn get_pull(
        &self,
        owner: &str,
        repo: &str,
        number: PullRequestNumber,
    ) -> Result<PullRequest> {
        decode(
            self.get(&format!("/repos/{owner}/{repo}/pulls/{number}"), None, None)
                .await?,
        )
    }

    /// Check runs reported against a commit. The page body is an object
    /// with a `check_runs` array, not a bare array.
    pub fn list_check_runs(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
        per_page: u32,
    ) -> Result<Paginator<'_>> {
        self.paginate(
            &format!("/repos/{owner}/{repo}/commits/{git_ref}/check-runs"),
            None,
            per_page,
            None,
        )
    }

    /// The server's own view of the current quota.
    pub async fn rate_limit_status(&self) -> Result<Value> {
        self.get("/rate_limit", None, None).await
    }
}

fn json_body(response: &ApiResponse) -> Result<Value> {
    serde_json::from_slice(&response.body)
        .map_err(|e| GithubError::api(format!("failed to decode response body: {e}")))
}

/// Short opaque id tying a request's log lines together. Never sent to
/// the server.
fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
