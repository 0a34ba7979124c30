use super::PageSource;
use crate::auth::TokenManager;
use crate::budget::RequestBudget;
use crate::model::{format_bound, ListingResponse, Page, PageOutcome, PageRequest};
use async_trait::async_trait;
use listings_core::{Error, Result};
use metrics::{counter, histogram};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// HTTP client for the listing endpoint. Every call takes a valid token and one budget unit.
pub struct PageFetcher {
    http: reqwest::Client,
    listings_url: String,
    tokens: Arc<TokenManager>,
    budget: Arc<RequestBudget>,
    page_size: u32,
    request_delay: Duration,
}

impl PageFetcher {
    pub fn new(
        http: reqwest::Client,
        listings_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        budget: Arc<RequestBudget>,
        page_size: u32,
        request_delay: Duration,
    ) -> Self {
        Self {
            http,
            listings_url: listings_url.into(),
            tokens,
            budget,
            page_size,
            request_delay,
        }
    }

    fn query(&self, request: &PageRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("limit", self.page_size.to_string()),
            ("page", request.page.to_string()),
        ];
        if let Some(before) = request.before {
            query.push(("before", format_bound(before)));
        }
        if let Some(after) = request.after {
            query.push(("after", format_bound(after)));
        }
        query
    }

    async fn send_page_request(&self, request: PageRequest, access_token: &str) -> Page {
        let response = match self
            .http
            .get(&self.listings_url)
            .bearer_auth(access_token)
            .query(&self.query(&request))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(page = request.page, error = %e, "Failed to fetch page");
                return Page::soft_failure(request, format!("transport error: {e}"));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!(page = request.page, status = status.as_u16(), error = %e, "Failed to read page body");
                return Page::soft_failure(request, format!("body read error: {e}"));
            }
        };

        if status != StatusCode::OK {
            warn!(page = request.page, status = status.as_u16(), body = %body, "Failed to fetch page");
            return Page::soft_failure(request, format!("status {}: {}", status.as_u16(), body));
        }

        match serde_json::from_str::<ListingResponse>(&body) {
            Ok(listing) => {
                debug!(page = request.page, records = listing.animals.len(), "Fetched page");
                Page::ok(request, listing.animals)
            }
            Err(e) => {
                warn!(page = request.page, error = %e, "Failed to decode page");
                Page::soft_failure(request, format!("decode error: {e}"))
            }
        }
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    #[instrument(skip(self))]
    async fn fetch_total_count(&self) -> Result<u64> {
        let token = self.tokens.ensure_valid_token().await?;
        if !self.budget.try_admit() {
            warn!("Request budget exhausted before total count");
            return Ok(0);
        }

        let response = self
            .http
            .get(&self.listings_url)
            .bearer_auth(&token.access_token)
            .query(&[("limit", "1")])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            return Err(Error::Fetch {
                status: status.as_u16(),
                body,
            });
        }

        let listing: ListingResponse = serde_json::from_str(&body)?;
        let pagination = listing.pagination.ok_or_else(|| Error::Fetch {
            status: status.as_u16(),
            body: "response carried no pagination block".to_string(),
        })?;

        debug!(
            total_count = pagination.total_count,
            total_pages = ?pagination.total_pages,
            "Fetched total count"
        );

        Ok(pagination.total_count)
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Page> {
        let token = self.tokens.ensure_valid_token().await?;
        if !self.budget.try_admit() {
            debug!(page = request.page, "Request budget exhausted, page not requested");
            return Ok(Page::refused(request));
        }

        let started = Instant::now();
        let page = self.send_page_request(request, &token.access_token).await;
        histogram!("ingester_fetch_duration_ms").record(started.elapsed().as_millis() as f64);

        match &page.outcome {
            PageOutcome::Ok => counter!("ingester_pages_fetched").increment(1),
            _ => counter!("ingester_page_soft_failures").increment(1),
        }

        // courtesy delay applies per worker, after success or failure alike
        tokio::time::sleep(self.request_delay).await;

        Ok(page)
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn budget(&self) -> &RequestBudget {
        &self.budget
    }
}
