//! Windowed, page-by-page fetch of every opportunity posted in a date range.

use chrono::NaiveDate;
use futures_util::{stream, StreamExt, TryStreamExt};
use rfps_adapters::{SamGovTransport, SearchQuery, SearchTransport};
use rfps_core::{parse_search_page, SchemaValidationError, ScrapeResult, SearchResponsePage};
use rfps_storage::FetchError;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::SyncConfig;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("could not open search session: {0}")]
    Session(String),
    #[error("search API returned status {status} at offset {offset}: {body}")]
    Transport { status: u16, offset: u64, body: String },
    #[error("search request failed at offset {offset}: {source}")]
    Request {
        offset: u64,
        #[source]
        source: FetchError,
    },
    #[error("search page at offset {offset} failed validation: {source}")]
    Schema {
        offset: u64,
        #[source]
        source: SchemaValidationError,
    },
}

/// Offsets of every page after the first.
///
/// Total pages is `ceil(total_records / limit)` with a floor of one, so an
/// exact multiple of `limit` never produces a trailing empty request.
pub fn additional_page_offsets(total_records: u64, limit: u32) -> Vec<u64> {
    let limit = u64::from(limit.max(1));
    let total_pages = total_records.div_ceil(limit).max(1);
    (1..total_pages).map(|index| index * limit).collect()
}

pub struct PaginationDriver<T> {
    transport: T,
    page_concurrency: usize,
}

impl<T: SearchTransport> PaginationDriver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            page_concurrency: 1,
        }
    }

    /// Pages after the first may be fetched up to `n` at a time; results are
    /// still assembled in offset order.
    pub fn with_page_concurrency(mut self, n: usize) -> Self {
        self.page_concurrency = n.max(1);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn run(&self, start_date: NaiveDate, end_date: NaiveDate) -> Result<ScrapeResult, ScrapeError> {
        let span = info_span!(
            "scrape_window",
            source = self.transport.source_id(),
            %start_date,
            %end_date
        );
        self.run_window(start_date, end_date).instrument(span).await
    }

    async fn run_window(&self, start_date: NaiveDate, end_date: NaiveDate) -> Result<ScrapeResult, ScrapeError> {
        info!("scrape session started");
        let first_query = SearchQuery::first_page(start_date, end_date);
        let first = self.fetch_validated(&first_query).await?;

        let offsets = additional_page_offsets(first.total_records, first_query.limit);
        info!(
            total_records = first.total_records,
            additional_pages = offsets.len(),
            "pagination plan computed"
        );

        let mut result = ScrapeResult {
            opportunities: first.opportunities_data,
            reported_total: first.total_records,
            pages_fetched: 1,
            drift: false,
        };

        for (offset, page) in self.fetch_remaining(&first_query, &offsets).await? {
            if page.total_records != result.reported_total {
                warn!(
                    offset,
                    first_total = result.reported_total,
                    page_total = page.total_records,
                    "totalRecords changed mid-run"
                );
                result.drift = true;
            }
            result.pages_fetched += 1;
            result.opportunities.extend(page.opportunities_data);
        }

        if !result.is_complete() {
            warn!(
                records = result.len(),
                reported_total = result.reported_total,
                "record count differs from reported total"
            );
        }
        info!(records = result.len(), pages = result.pages_fetched, "scrape complete");
        Ok(result)
    }

    async fn fetch_remaining(
        &self,
        first_query: &SearchQuery,
        offsets: &[u64],
    ) -> Result<Vec<(u64, SearchResponsePage)>, ScrapeError> {
        let mut pages = if self.page_concurrency <= 1 {
            let mut pages = Vec::with_capacity(offsets.len());
            for &offset in offsets {
                let page = self.fetch_validated(&first_query.at_offset(offset)).await?;
                pages.push((offset, page));
            }
            pages
        } else {
            stream::iter(offsets.iter().copied())
                .map(|offset| async move {
                    let page = self.fetch_validated(&first_query.at_offset(offset)).await?;
                    Ok::<_, ScrapeError>((offset, page))
                })
                .buffer_unordered(self.page_concurrency)
                .try_collect::<Vec<_>>()
                .await?
        };
        pages.sort_by_key(|(offset, _)| *offset);
        Ok(pages)
    }

    async fn fetch_validated(&self, query: &SearchQuery) -> Result<SearchResponsePage, ScrapeError> {
        let offset = query.effective_offset();
        info!(offset, limit = query.limit, "fetching search page");

        let body = self.transport.fetch_page(query).await.map_err(|err| match err {
            FetchError::HttpStatus { status, body, .. } => {
                error!(offset, status, %body, "search API returned non-success status");
                ScrapeError::Transport { status, offset, body }
            }
            other => {
                error!(offset, error = %other, "search request failed");
                ScrapeError::Request { offset, source: other }
            }
        })?;

        parse_search_page(&body).map_err(|source| {
            error!(
                offset,
                detail = %source.detail(),
                payload = %String::from_utf8_lossy(&body),
                "search page failed schema validation"
            );
            ScrapeError::Schema { offset, source }
        })
    }
}

/// Driver over an authenticated SAM.gov session built from `config`.
pub fn open_session(config: &SyncConfig) -> Result<PaginationDriver<SamGovTransport>, ScrapeError> {
    let transport = SamGovTransport::connect(config.http_client_config(), &config.api_key)
        .map_err(|err| ScrapeError::Session(format!("{err:#}")))?;
    Ok(PaginationDriver::new(transport).with_page_concurrency(config.page_concurrency))
}

/// Open an authenticated SAM.gov session, fetch the whole window, and release
/// the session before returning.
pub async fn run_scraping(
    config: &SyncConfig,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Result<ScrapeResult, ScrapeError> {
    open_session(config)?.run(start_date, end_date).await
}
