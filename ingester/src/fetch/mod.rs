pub mod page_fetcher;

use crate::budget::RequestBudget;
use crate::model::{Page, PageRequest};
use async_trait::async_trait;
use listings_core::Result;

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Total number of listings the endpoint reports. Returns 0 without a
    /// request if the budget is already spent.
    async fn fetch_total_count(&self) -> Result<u64>;

    /// Fetch one page. Budget refusal and per-page failures come back as a
    /// [`Page`] outcome; only credential failures are errors.
    async fn fetch_page(&self, request: PageRequest) -> Result<Page>;

    fn page_size(&self) -> u32;

    /// Budget this source draws from.
    fn budget(&self) -> &RequestBudget;
}

pub use page_fetcher::PageFetcher;
