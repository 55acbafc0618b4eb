//! Search transport contract + the SAM.gov HTTP and fixture-backed transports.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use rfps_core::{format_posted_date, API_MAX_LIMIT};
use rfps_storage::{FetchError, HttpClientConfig, HttpFetcher};
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "rfps-adapters";

pub const SAM_GOV_SOURCE_ID: &str = "sam-gov";
pub const SAM_GOV_BASE_URL: &str = "https://api.sam.gov/opportunities";
pub const SEARCH_PATH: &str = "/v2/search";

/// One `/v2/search` request for a posted-date window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
    pub limit: u32,
    /// `None` on the first page; the API is queried without `offset` there.
    pub offset: Option<u64>,
}

impl SearchQuery {
    pub fn first_page(posted_from: NaiveDate, posted_to: NaiveDate) -> Self {
        Self {
            posted_from,
            posted_to,
            limit: API_MAX_LIMIT,
            offset: None,
        }
    }

    pub fn at_offset(&self, offset: u64) -> Self {
        Self {
            offset: Some(offset),
            ..self.clone()
        }
    }

    pub fn effective_offset(&self) -> u64 {
        self.offset.unwrap_or(0)
    }

    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("limit".to_string(), self.limit.to_string()),
            ("postedFrom".to_string(), format_posted_date(self.posted_from)),
            ("postedTo".to_string(), format_posted_date(self.posted_to)),
        ];
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

#[async_trait]
pub trait SearchTransport: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Raw body of a successful response; non-success statuses are errors.
    async fn fetch_page(&self, query: &SearchQuery) -> Result<Vec<u8>, FetchError>;
}

/// Authenticated SAM.gov session: base URL plus the `api_key` default parameter.
#[derive(Debug)]
pub struct SamGovTransport {
    http: HttpFetcher,
}

impl SamGovTransport {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }

    pub fn connect(mut config: HttpClientConfig, api_key: &str) -> Result<Self> {
        config.default_query.retain(|(k, _)| k != "api_key");
        config
            .default_query
            .push(("api_key".to_string(), api_key.to_string()));
        let http = HttpFetcher::new(config).context("building SAM.gov session")?;
        Ok(Self::new(http))
    }
}

#[async_trait]
impl SearchTransport for SamGovTransport {
    fn source_id(&self) -> &'static str {
        SAM_GOV_SOURCE_ID
    }

    async fn fetch_page(&self, query: &SearchQuery) -> Result<Vec<u8>, FetchError> {
        let resp = self.http.get(SEARCH_PATH, &query.to_query_pairs()).await?;
        debug!(url = %resp.final_url, bytes = resp.body.len(), "search page fetched");
        Ok(resp.body)
    }
}

#[derive(Debug, Clone)]
pub enum FixtureResponse {
    Body(Vec<u8>),
    Status { status: u16, body: String },
}

/// Serves canned responses keyed by offset and records every query it sees.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    pages: BTreeMap<u64, FixtureResponse>,
    requests: Mutex<Vec<SearchQuery>>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, offset: u64, body: impl Into<Vec<u8>>) -> Self {
        self.pages.insert(offset, FixtureResponse::Body(body.into()));
        self
    }

    pub fn with_status(mut self, offset: u64, status: u16, body: impl Into<String>) -> Self {
        self.pages.insert(
            offset,
            FixtureResponse::Status {
                status,
                body: body.into(),
            },
        );
        self
    }

    pub fn with_page_file(self, offset: u64, path: impl AsRef<Path>) -> Result<Self> {
        let body = load_fixture_page(path)?;
        Ok(self.with_page(offset, body))
    }

    pub async fn requests(&self) -> Vec<SearchQuery> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl SearchTransport for FixtureTransport {
    fn source_id(&self) -> &'static str {
        SAM_GOV_SOURCE_ID
    }

    async fn fetch_page(&self, query: &SearchQuery) -> Result<Vec<u8>, FetchError> {
        self.requests.lock().await.push(query.clone());
        let offset = query.effective_offset();
        match self.pages.get(&offset) {
            Some(FixtureResponse::Body(body)) => Ok(body.clone()),
            Some(FixtureResponse::Status { status, body }) => Err(FetchError::HttpStatus {
                status: *status,
                url: format!("fixture://{SEARCH_PATH}?offset={offset}"),
                body: body.clone(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: format!("fixture://{SEARCH_PATH}?offset={offset}"),
                body: "no fixture page for offset".to_string(),
            }),
        }
    }
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice::<serde_json::Value>(&bytes)
        .with_context(|| format!("fixture {} is not JSON", path.display()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfps_core::parse_search_page;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn fixture_path(name: &str) -> PathBuf {
        workspace_root().join("fixtures").join("sam-gov").join(name)
    }

    fn window() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2025, 4, 28).unwrap(),
            NaiveDate::from_ymd_opt(2025, 4, 29).unwrap(),
        )
    }

    #[test]
    fn first_page_query_omits_offset() {
        let (from, to) = window();
        let pairs = SearchQuery::first_page(from, to).to_query_pairs();
        assert_eq!(
            pairs,
            vec![
                ("limit".to_string(), "1000".to_string()),
                ("postedFrom".to_string(), "04/28/2025".to_string()),
                ("postedTo".to_string(), "04/29/2025".to_string()),
            ]
        );
    }

    #[test]
    fn later_pages_carry_offset_and_same_window() {
        let (from, to) = window();
        let next = SearchQuery::first_page(from, to).at_offset(2000);
        assert_eq!(next.effective_offset(), 2000);
        let pairs = next.to_query_pairs();
        assert_eq!(pairs.last(), Some(&("offset".to_string(), "2000".to_string())));
        assert!(pairs.contains(&("postedFrom".to_string(), "04/28/2025".to_string())));
        assert!(pairs.contains(&("limit".to_string(), "1000".to_string())));
    }

    #[test]
    fn basic_fixture_validates() {
        let bytes = load_fixture_page(fixture_path("search_page_basic.json")).expect("fixture");
        let page = parse_search_page(&bytes).expect("basic page parses");
        assert_eq!(page.opportunities_data.len(), 1);
        assert_eq!(page.opportunities_data[0].notice_id, "f5ee2b7d16634065b904c6943bb0c0eb");
    }

    #[test]
    fn complex_fixture_validates_every_record() {
        let bytes = load_fixture_page(fixture_path("search_page_complex.json")).expect("fixture");
        let raw: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        let expected = raw["opportunitiesData"].as_array().expect("array").len();
        let page = parse_search_page(&bytes).expect("complex page parses");
        assert_eq!(page.opportunities_data.len(), expected);
        assert_eq!(page.total_records as usize, expected);
    }

    #[tokio::test]
    async fn fixture_transport_serves_by_offset_and_records_queries() {
        let (from, to) = window();
        let transport = FixtureTransport::new()
            .with_page_file(0, fixture_path("search_page_basic.json"))
            .expect("fixture")
            .with_status(1000, 500, "upstream exploded");

        let first = SearchQuery::first_page(from, to);
        assert!(transport.fetch_page(&first).await.is_ok());
        let err = transport
            .fetch_page(&first.at_offset(1000))
            .await
            .expect_err("scripted failure");
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));

        let seen = transport.requests().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].offset, None);
        assert_eq!(seen[1].offset, Some(1000));
    }
}
