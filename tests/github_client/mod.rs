//! `GithubClient` tests.
//!
//! These tests exercise the request pipeline against a local HTTP server.
//! Each test configures route handlers through [`TestBuilder`], builds a
//! client pointed at the server, executes some calls, and validates both
//! the results and the requests the server observed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use serde_json::json;

use checkwatch::github::{
    Authenticator, CircuitBreaker, CircuitState, ClientConfig, GithubClient, GithubError,
};

use super::common::{Events, HttpServer, HttpServerHandle, Method::*, Response, TestBuilder};

/// A context used for running a test.
struct GhTestCtx {
    gh: GithubClient,
    events: Events,
    #[allow(dead_code)] // held for drop
    server: HttpServerHandle,
}

fn future_reset() -> u64 {
    SystemTime::UNIX_EPOCH.elapsed().unwrap().as_secs() + 1800
}

impl TestBuilder {
    fn build_gh(self) -> GhTestCtx {
        self.build_gh_with(ClientConfig::default(), None)
    }

    fn build_gh_with(
        self,
        mut config: ClientConfig,
        breaker: Option<CircuitBreaker>,
    ) -> GhTestCtx {
        self.maybe_enable_logging();
        let events = Events::new();
        let server = HttpServer::new(self.handlers, events.clone());
        config.base_url = format!("http://{}", server.addr);
        let auth = Authenticator::personal_token("sekrit-token").unwrap();
        let gh = match breaker {
            Some(breaker) => GithubClient::with_breaker(auth, config, breaker),
            None => GithubClient::new(auth, config),
        }
        .unwrap();
        GhTestCtx { gh, events, server }
    }
}

#[tokio::test]
async fn happy_path_get_updates_governor_and_breaker() {
    let ctx = TestBuilder::default()
        .handler(GET, "user", |req| {
            // The credential is injected as the literal `<scheme> <token>`.
            assert_eq!(req.headers["authorization"], "token sekrit-token");
            assert_eq!(req.headers["accept"], "application/vnd.github.v3+json");
            Response::new()
                .json(json!({"login": "u", "id": 1}))
                .rate_limit(5000, 4999, future_reset())
        })
        .build_gh();

    let body = ctx.gh.get("/user", None, None).await.unwrap();
    assert_eq!(body, json!({"login": "u", "id": 1}));

    let snapshot = ctx.gh.rate_limiter().snapshot("core").unwrap();
    assert_eq!(snapshot.remaining, 4999);
    assert_eq!(snapshot.limit, 5000);
    assert_eq!(ctx.gh.circuit_breaker().failure_count(), 0);
    assert_eq!(ctx.gh.circuit_breaker().state(), CircuitState::Closed);
    ctx.events.assert_eq(&[(GET, "/user")]);
}

#[tokio::test]
async fn typed_user_and_repository_lookups() {
    let ctx = TestBuilder::default()
        .handler(GET, "user", |_req| {
            Response::new().json(json!({"login": "octocat", "id": 583231}))
        })
        .handler(GET, "repos/rust-lang/rust", |_req| {
            Response::new().json(json!({
                "full_name": "rust-lang/rust",
                "default_branch": "master",
                "fork": false
            }))
        })
        .build_gh();

    let user = ctx.gh.get_user().await.unwrap();
    assert_eq!(user.login, "octocat");
    assert_eq!(user.id, 583231);

    let repo = ctx.gh.get_repository("rust-lang", "rust").await.unwrap();
    assert_eq!(repo.full_name, "rust-lang/rust");
    assert_eq!(repo.default_branch, "master");
    assert_eq!(repo.owner(), "rust-lang");
    assert_eq!(repo.name(), "rust");
}

#[tokio::test]
async fn retries_500_then_succeeds() {
    let calls = AtomicUsize::new(0);
    let ctx = TestBuilder::default()
        .handler(GET, "user", move |_req| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Response::new().status(500).json(json!({"message": "boom"}))
            } else {
                Response::new().json(json!({"login": "u", "id": 1}))
            }
        })
        .build_gh();

    let body = ctx.gh.get("/user", None, None).await.unwrap();
    assert_eq!(body["login"], "u");
    // Exactly two attempts were made, and the success reset the breaker.
    ctx.events.assert_eq(&[(GET, "/user"), (GET, "/user")]);
    assert_eq!(ctx.gh.circuit_breaker().failure_count(), 0);
}

#[tokio::test]
async fn rate_limit_403_surfaces_parsed_fields_without_retry() {
    let ctx = TestBuilder::default()
        .handler(GET, "user", |_req| {
            Response::new()
                .status(403)
                .json(json!({"message": "API rate limit exceeded"}))
                .rate_limit(5000, 0, 1700000000)
        })
        .build_gh();

    let err = ctx.gh.get("/user", None, None).await.unwrap_err();
    let GithubError::RateLimit {
        reset,
        remaining,
        limit,
        ..
    } = err
    else {
        panic!("expected rate limit error, got {err:?}");
    };
    assert_eq!(reset, Some(1700000000));
    assert_eq!(remaining, 0);
    assert_eq!(limit, 5000);
    ctx.events.assert_eq(&[(GET, "/user")]);
}

#[tokio::test]
async fn non_rate_limit_403_is_an_authentication_error() {
    let ctx = TestBuilder::default()
        .handler(GET, "user", |_req| {
            Response::new()
                .status(403)
                .json(json!({"message": "Resource not accessible by integration"}))
        })
        .build_gh();

    let err = ctx.gh.get("/user", None, None).await.unwrap_err();
    assert!(matches!(err, GithubError::Authentication { .. }));
    assert_eq!(err.status(), Some(403));
    ctx.events.assert_eq(&[(GET, "/user")]);
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let ctx = TestBuilder::default()
        .handler(GET, "user", |_req| {
            Response::new()
                .status(401)
                .json(json!({"message": "Bad credentials"}))
        })
        .build_gh();

    let err = ctx.gh.get("/user", None, None).await.unwrap_err();
    assert!(matches!(err, GithubError::Authentication { .. }));
    assert_eq!(err.status(), Some(401));
    // No breaker failure for a 4xx.
    assert_eq!(ctx.gh.circuit_breaker().failure_count(), 0);
    ctx.events.assert_eq(&[(GET, "/user")]);
}

#[tokio::test]
async fn breaker_opens_after_failures_then_recovers() {
    let calls = AtomicUsize::new(0);
    let config = ClientConfig {
        max_retries: 1,
        ..ClientConfig::default()
    };
    let ctx = TestBuilder::default()
        .handler(GET, "user", move |_req| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Response::new()
                    .status(500)
                    .json(json!({"message": "internal error"}))
            } else {
                Response::new().json(json!({"login": "u", "id": 1}))
            }
        })
        .build_gh_with(config, Some(CircuitBreaker::new(2, Duration::from_secs(1))));

    // Two consecutive 500s (initial attempt + one retry) open the circuit.
    let err = ctx.gh.get("/user", None, None).await.unwrap_err();
    assert!(matches!(err, GithubError::Server { status: 500, .. }));
    assert_eq!(ctx.gh.circuit_breaker().state(), CircuitState::Open);

    // While open, calls are refused before reaching the server.
    let err = ctx.gh.get("/user", None, None).await.unwrap_err();
    let GithubError::Connection { message } = &err else {
        panic!("expected connection error, got {err:?}");
    };
    assert!(message.contains("circuit breaker open"), "{message}");
    ctx.events.assert_eq(&[(GET, "/user"), (GET, "/user")]);

    // After the cooldown a probe goes through, succeeds, and closes the
    // circuit.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let body = ctx.gh.get("/user", None, None).await.unwrap();
    assert_eq!(body["login"], "u");
    assert_eq!(ctx.gh.circuit_breaker().state(), CircuitState::Closed);
    assert_eq!(ctx.gh.circuit_breaker().failure_count(), 0);
    ctx.events
        .assert_eq(&[(GET, "/user"), (GET, "/user"), (GET, "/user")]);
}

#[tokio::test]
async fn governor_blocks_before_dispatch_inside_buffer() {
    let ctx = TestBuilder::default()
        .handler(GET, "user", |_req| {
            // 50 remaining is inside the default buffer of 100.
            Response::new()
                .json(json!({"login": "u", "id": 1}))
                .rate_limit(5000, 50, future_reset())
        })
        .build_gh();

    ctx.gh.get("/user", None, None).await.unwrap();

    let err = ctx.gh.get("/user", None, None).await.unwrap_err();
    let GithubError::RateLimit {
        remaining, limit, ..
    } = err
    else {
        panic!("expected rate limit error, got {err:?}");
    };
    assert_eq!(remaining, 50);
    assert_eq!(limit, 5000);
    // The second call never reached the server.
    ctx.events.assert_eq(&[(GET, "/user")]);
}

#[tokio::test]
async fn paginator_walks_pages_in_order() {
    let ctx = TestBuilder::default()
        .handler(GET, "repos/o/r/pulls", |req| {
            if req.query_value("page") == Some("2") {
                // The next link is followed verbatim, without re-merging
                // the first request's parameters.
                assert_eq!(req.query_string(), "page=2");
                Response::new().json(json!([{"id": 3}, {"id": 4}]))
            } else {
                assert_eq!(req.query_value("state"), Some("open"));
                assert_eq!(req.query_value("per_page"), Some("30"));
                Response::new()
                    .json(json!([{"id": 1}, {"id": 2}]))
                    .header(format!(
                        "Link: <{}/repos/o/r/pulls?page=2>; rel=\"next\"",
                        req.base()
                    ))
            }
        })
        .build_gh();

    let params = [("state".to_string(), "open".to_string())];
    let paginator = ctx
        .gh
        .paginate("/repos/o/r/pulls", Some(&params), 30, None)
        .unwrap();
    let items = paginator.collect_all().await.unwrap();
    let ids: Vec<_> = items.iter().map(|item| item["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, [1, 2, 3, 4]);
    ctx.events
        .assert_eq(&[(GET, "/repos/o/r/pulls"), (GET, "/repos/o/r/pulls")]);
}

#[tokio::test]
async fn paginator_stops_at_page_cap() {
    let ctx = TestBuilder::default()
        .handler(GET, "repos/o/r/pulls", |req| {
            let page: u64 = req
                .query_value("page")
                .map(|p| p.parse().unwrap())
                .unwrap_or(1);
            // There is always another page; only the cap ends iteration.
            Response::new()
                .json(json!([{"id": page}]))
                .header(format!(
                    "Link: <{}/repos/o/r/pulls?page={}>; rel=\"next\"",
                    req.base(),
                    page + 1
                ))
        })
        .build_gh();

    let paginator = ctx.gh.paginate("/repos/o/r/pulls", None, 100, Some(3)).unwrap();
    let items = paginator.collect_all().await.unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(ctx.events.len(), 3);
}

#[tokio::test]
async fn collect_pages_bounds_the_walk() {
    let ctx = TestBuilder::default()
        .handler(GET, "repos/o/r/pulls", |req| {
            let page: u64 = req
                .query_value("page")
                .map(|p| p.parse().unwrap())
                .unwrap_or(1);
            Response::new()
                .json(json!([{"id": page}]))
                .header(format!(
                    "Link: <{}/repos/o/r/pulls?page={}>; rel=\"next\"",
                    req.base(),
                    page + 1
                ))
        })
        .build_gh();

    let paginator = ctx.gh.paginate("/repos/o/r/pulls", None, 100, None).unwrap();
    let items = paginator.collect_pages(2).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(ctx.events.len(), 2);
}

#[tokio::test]
async fn per_page_is_clamped_to_server_maximum() {
    let ctx = TestBuilder::default()
        .handler(GET, "repos/o/r/pulls", |req| {
            assert_eq!(req.query_value("per_page"), Some("100"));
            Response::new().json(json!([]))
        })
        .build_gh();

    let paginator = ctx.gh.paginate("/repos/o/r/pulls", None, 500, None).unwrap();
    assert!(paginator.collect_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_maps_204_to_none() {
    let ctx = TestBuilder::default()
        .handler(DELETE, "repos/o/r/labels/bug", |_req| {
            Response::new().status(204)
        })
        .handler(DELETE, "repos/o/r/labels/junk", |_req| {
            Response::new().json(json!({"ok": true}))
        })
        .build_gh();

    let result = ctx.gh.delete("/repos/o/r/labels/bug", None, None).await.unwrap();
    assert!(result.is_none());

    // A delete that answers with a body decodes it.
    let result = ctx.gh.delete("/repos/o/r/labels/junk", None, None).await.unwrap();
    assert_eq!(result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn post_sends_json_body() {
    let ctx = TestBuilder::default()
        .handler(POST, "repos/o/r/issues", |req| {
            assert_eq!(req.headers["content-type"], "application/json");
            assert_eq!(req.json(), json!({"title": "hi"}));
            Response::new().status(201).json(json!({"number": 9}))
        })
        .build_gh();

    let body = ctx
        .gh
        .post("/repos/o/r/issues", Some(&json!({"title": "hi"})), None, None)
        .await
        .unwrap();
    assert_eq!(body["number"], 9);
}

#[tokio::test]
async fn close_releases_pool_and_reinitialises_on_demand() {
    let ctx = TestBuilder::default()
        .handler(GET, "user", |_req| {
            Response::new().json(json!({"login": "u", "id": 1}))
        })
        .build_gh();

    ctx.gh.get("/user", None, None).await.unwrap();
    ctx.gh.close();
    ctx.gh.get("/user", None, None).await.unwrap();
    ctx.events.assert_eq(&[(GET, "/user"), (GET, "/user")]);
}

#[tokio::test]
async fn rate_limit_status_returns_quota_document() {
    let ctx = TestBuilder::default()
        .handler(GET, "rate_limit", |_req| {
            Response::new().json(json!({
                "resources": {"core": {"limit": 5000, "remaining": 4000, "reset": 1700000000}}
            }))
        })
        .build_gh();

    let status = ctx.gh.rate_limit_status().await.unwrap();
    assert_eq!(status["resources"]["core"]["remaining"], 4000);
}
