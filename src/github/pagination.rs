//! Link-header pagination.
//!
//! GitHub splits large collections across pages and points at the
//! neighbours through the RFC 5988 `Link` response header. [`Paginator`]
//! walks those links lazily: one page fetch per pull, stopping at the end
//! of the collection or at a caller-imposed page cap.

use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;

use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing as log;
use url::Url;

use crate::github::client::GithubClient;
use crate::github::error::Result;

/// Server-side maximum for `per_page`.
pub const MAX_PER_PAGE: u32 = 100;

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([^>]+)>;\s*rel="([^"]+)""#).expect("link header regex is valid")
});

/// Parsed `Link` header: relation name to absolute URL.
///
/// Empty when the header is absent or unparsable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkHeader {
    links: HashMap<String, String>,
}

impl LinkHeader {
    pub fn parse(header: Option<&str>) -> Self {
        let mut links = HashMap::new();
        if let Some(header) = header {
            for capture in LINK_RE.captures_iter(header) {
                links.insert(capture[2].to_string(), capture[1].to_string());
            }
        }
        LinkHeader { links }
    }

    pub fn get(&self, rel: &str) -> Option<&str> {
        self.links.get(rel).map(String::as_str)
    }

    pub fn next_url(&self) -> Option<&str> {
        self.get("next")
    }

    pub fn prev_url(&self) -> Option<&str> {
        self.get("prev")
    }

    pub fn first_url(&self) -> Option<&str> {
        self.get("first")
    }

    pub fn last_url(&self) -> Option<&str> {
        self.get("last")
    }

    pub fn has_next(&self) -> bool {
        self.links.contains_key("next")
    }

    pub fn has_prev(&self) -> bool {
        self.links.contains_key("prev")
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Page number from the `last` link's `page` query parameter.
    pub fn last_page_number(&self) -> Option<u64> {
        let last = Url::parse(self.last_url()?).ok()?;
        last.query_pairs()
            .find(|(name, _)| name == "page")
            .and_then(|(_, value)| value.parse::<u64>().ok())
    }
}

/// One fetched page: decoded body, response headers, and the URL used.
#[derive(Debug)]
pub struct Page {
    pub body: Value,
    pub headers: HeaderMap,
    pub url: Url,
    links: LinkHeader,
}

impl Page {
    pub fn new(body: Value, headers: HeaderMap, url: Url) -> Self {
        let links = LinkHeader::parse(headers.get("link").and_then(|v| v.to_str().ok()));
        Page {
            body,
            headers,
            url,
            links,
        }
    }

    /// Elements of an array-shaped body; empty for any other shape.
    pub fn items(&self) -> &[Value] {
        self.body.as_array().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn links(&self) -> &LinkHeader {
        &self.links
    }

    pub fn has_next_page(&self) -> bool {
        self.links.has_next()
    }

    pub fn next_page_url(&self) -> Option<&str> {
        self.links.next_url()
    }

    pub fn total_pages(&self) -> Option<u64> {
        self.links.last_page_number()
    }
}

/// Lazy single-pass cursor over a paginated collection.
///
/// The configured query parameters (plus `per_page`) are sent on the first
/// request only; `next` links already carry every parameter and are
/// followed verbatim.
pub struct Paginator<'a> {
    client: &'a GithubClient,
    next_url: Option<Url>,
    params: Vec<(String, String)>,
    max_pages: Option<u32>,
    pages_fetched: u32,
    buffered: VecDeque<Value>,
}

impl<'a> Paginator<'a> {
    pub(crate) fn new(
        client: &'a GithubClient,
        start: Url,
        params: Option<&[(String, String)]>,
        per_page: u32,
        max_pages: Option<u32>,
    ) -> Self {
        let mut params = params.map(<[_]>::to_vec).unwrap_or_default();
        params.push((
            "per_page".to_string(),
            per_page.min(MAX_PER_PAGE).to_string(),
        ));
        Paginator {
            client,
            next_url: Some(start),
            params,
            max_pages,
            pages_fetched: 0,
            buffered: VecDeque::new(),
        }
    }

    /// Fetch the next page, or `None` once the collection (or the page
    /// cap) is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if let Some(cap) = self.max_pages
            && self.pages_fetched >= cap
        {
            return Ok(None);
        }
        let Some(url) = self.next_url.take() else {
            return Ok(None);
        };

        let first = self.pages_fetched == 0;
        let params = first.then_some(self.params.as_slice());
        let page = self.client.fetch_page(url, params).await?;
        self.pages_fetched += 1;

        self.next_url = match page.next_page_url() {
            Some(next) => match Url::parse(next) {
                Ok(next) => Some(next),
                Err(e) => {
                    log::warn!("ignoring unparsable next link {next:?}: {e}");
                    None
                }
            },
            None => None,
        };
        Ok(Some(page))
    }

    /// Next element of the collection, pulling pages as needed. Intended
    /// for endpoints whose page body is a bare array.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some(item));
            }
            match self.next_page().await? {
                Some(page) => {
                    if let Value::Array(items) = page.body {
                        self.buffered.extend(items);
                    }
                }
                None => return Ok(None),
            }
        }
    }

    /// Everything the cursor has left, in one in-memory sequence.
    pub async fn collect_all(mut self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Items from at most `pages` further pages.
    pub async fn collect_pages(mut self, pages: u32) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut fetched = 0;
        while fetched < pages {
            match self.next_page().await? {
                Some(page) => {
                    items.extend(page.items().iter().cloned());
                    fetched += 1;
                }
                None => break,
            }
        }
        Ok(items)
    }
}
