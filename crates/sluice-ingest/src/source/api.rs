//! Paginated JSON API source
//!
//! Each page is fetched with a GET request. Records are the array found at
//! `data_path`; the locator of the following page is read from
//! `next_page_path`. A missing, `null`, `false` or empty locator ends the
//! sequence, and so does reaching `max_pages` whatever the API claims.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use super::{RawRecord, SourceCursor, SourceReader};
use crate::error::{IngestError, IngestResult};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_PAGES: u32 = 1_000;

fn default_data_path() -> String {
    "data".to_string()
}

fn default_next_page_path() -> String {
    "next".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_pages() -> u32 {
    DEFAULT_MAX_PAGES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSourceConfig {
    /// First page
    pub url: String,
    /// Dot path to the record array, e.g. `data` or `result.items`
    #[serde(default = "default_data_path")]
    pub data_path: String,
    /// Dot path to the next page locator
    #[serde(default = "default_next_page_path")]
    pub next_page_path: String,
    /// Dot path to a total record count, if the API reports one
    #[serde(default)]
    pub total_path: Option<String>,
    /// When set, the locator is a token sent in this query parameter
    #[serde(default)]
    pub page_param: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Static request headers such as `Authorization`
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ApiSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            data_path: default_data_path(),
            next_page_path: default_next_page_path(),
            total_path: None,
            page_param: None,
            timeout_ms: default_timeout_ms(),
            max_pages: default_max_pages(),
            headers: BTreeMap::new(),
        }
    }
}

pub struct PaginatedApiSource {
    client: Client,
    config: ApiSourceConfig,
    base_url: Url,
    data_pointer: String,
    next_pointer: String,
    total_pointer: Option<String>,
    /// Page to fetch once the buffered records run out
    next_url: Option<Url>,
    /// Page the buffered records came from
    current_url: Option<Url>,
    /// Pages fetched so far, counting pages fetched before a resume
    pages_fetched: u32,
    buffered: VecDeque<Value>,
    taken_from_page: usize,
    skip_on_next_page: usize,
    estimated_total: Option<u64>,
}

impl PaginatedApiSource {
    /// Build the source; `resume` is `(page_url, page_number, records_to_skip)`
    pub fn new(config: &ApiSourceConfig, resume: Option<(String, u32, usize)>) -> IngestResult<Self> {
        if config.max_pages == 0 {
            return Err(IngestError::Config("maxPages must be at least 1".to_string()));
        }
        let base_url = parse_url(&config.url)?;

        let (first, pages_fetched, skip) = match resume {
            Some((url, page, skip)) => (parse_url(&url)?, page.saturating_sub(1), skip),
            None => (base_url.clone(), 0, 0),
        };

        let client = Client::builder()
            .user_agent(concat!("sluice-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            base_url,
            data_pointer: json_pointer(&config.data_path),
            next_pointer: json_pointer(&config.next_page_path),
            total_pointer: config.total_path.as_deref().map(json_pointer),
            next_url: Some(first),
            current_url: None,
            pages_fetched,
            buffered: VecDeque::new(),
            taken_from_page: 0,
            skip_on_next_page: skip,
            estimated_total: None,
        })
    }

    async fn fetch_page(&mut self, url: Url) -> IngestResult<()> {
        let mut request = self
            .client
            .get(url.clone())
            .timeout(Duration::from_millis(self.config.timeout_ms));
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Source(format!("GET {url} returned {status}")));
        }
        let mut body: Value = response.json().await?;

        if self.estimated_total.is_none() {
            self.estimated_total = self
                .total_pointer
                .as_deref()
                .and_then(|pointer| body.pointer(pointer))
                .and_then(Value::as_u64);
        }
        let next = self.resolve_next(&url, body.pointer(&self.next_pointer))?;

        let records = match body.pointer_mut(&self.data_pointer) {
            Some(Value::Array(items)) => std::mem::take(items),
            Some(other) => {
                return Err(IngestError::Source(format!(
                    "{:?} in page {url} is {}, expected an array",
                    self.config.data_path,
                    type_name(other)
                )))
            },
            None => {
                return Err(IngestError::Source(format!(
                    "page {url} has no {:?} field",
                    self.config.data_path
                )))
            },
        };

        self.next_url = next;
        self.pages_fetched += 1;
        self.buffered = records.into();
        self.taken_from_page = 0;

        if self.skip_on_next_page > 0 {
            let skip = self.skip_on_next_page.min(self.buffered.len());
            self.buffered.drain(..skip);
            self.taken_from_page = skip;
            self.skip_on_next_page = 0;
        }

        tracing::debug!(
            url = %url,
            page = self.pages_fetched,
            records = self.buffered.len(),
            has_next = self.next_url.is_some(),
            "Fetched API page"
        );
        self.current_url = Some(url);
        Ok(())
    }

    fn resolve_next(&self, current: &Url, locator: Option<&Value>) -> IngestResult<Option<Url>> {
        let token = match locator {
            None | Some(Value::Null) | Some(Value::Bool(false)) => return Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) if self.config.page_param.is_some() => n.to_string(),
            Some(other) => {
                return Err(IngestError::Source(format!(
                    "next page locator is {}, expected a URL or token",
                    type_name(other)
                )))
            },
        };

        match &self.config.page_param {
            Some(param) => Ok(Some(with_query_param(&self.base_url, param, &token))),
            None => current
                .join(&token)
                .map(Some)
                .map_err(|e| IngestError::Source(format!("bad next page URL {token:?}: {e}"))),
        }
    }
}

#[async_trait]
impl SourceReader for PaginatedApiSource {
    async fn next_record(&mut self) -> IngestResult<Option<RawRecord>> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                self.taken_from_page += 1;
                return Ok(Some(RawRecord::Json(record)));
            }

            let Some(url) = self.next_url.take() else {
                return Ok(None);
            };
            if self.pages_fetched >= self.config.max_pages {
                tracing::warn!(
                    max_pages = self.config.max_pages,
                    next = %url,
                    "Page limit reached, ignoring remaining pages"
                );
                return Ok(None);
            }
            self.fetch_page(url).await?;
        }
    }

    fn cursor(&self) -> SourceCursor {
        match &self.current_url {
            Some(url) => SourceCursor::Page {
                url: url.to_string(),
                page: self.pages_fetched,
                skip: self.taken_from_page,
            },
            None => SourceCursor::Page {
                url: self
                    .next_url
                    .as_ref()
                    .unwrap_or(&self.base_url)
                    .to_string(),
                page: self.pages_fetched + 1,
                skip: self.skip_on_next_page,
            },
        }
    }

    fn estimated_total(&self) -> Option<u64> {
        self.estimated_total
    }
}

fn parse_url(raw: &str) -> IngestResult<Url> {
    Url::parse(raw).map_err(|e| IngestError::Config(format!("invalid API URL {raw:?}: {e}")))
}

fn with_query_param(base: &Url, param: &str, value: &str) -> Url {
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, value);
    url
}

/// JSON pointer for a dot separated path; numeric segments index arrays
///
/// An empty path selects the whole document.
pub fn json_pointer(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    path.split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
