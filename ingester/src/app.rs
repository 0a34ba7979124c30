use crate::auth::TokenManager;
use crate::budget::RequestBudget;
use crate::engine::{next_window, PaginationEngine, RecordFilter, SweepReport};
use crate::fetch::{PageFetcher, PageSource};
use crate::model::{Credential, Record, TimeWindow};
use crate::sink::object_store::S3BlobStore;
use crate::sink::warehouse::PostgresLoader;
use crate::sink::{IngestionSink, LandingReceipt, LandingSink};
use crate::transform::contact_email;
use chrono::{DateTime, Utc};
use listings_core::backoff::{retry_with_backoff, RetryPolicy};
use listings_core::{Config, Error, Result};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BackfillPlan {
    pub before: DateTime<Utc>,
    pub after: Option<DateTime<Utc>>,
    pub days: i64,
    pub max_windows: u32,
    pub contact_email: Option<String>,
}

impl BackfillPlan {
    fn first_window(&self) -> Result<TimeWindow> {
        match self.after {
            Some(after) => Ok(TimeWindow::new(self.before, after)),
            None => TimeWindow::spanning_days(self.before, self.days),
        }
    }
}

pub struct App {
    config: Config,
    http: reqwest::Client,
    tokens: Arc<TokenManager>,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api.request_timeout_secs))
            .build()?;

        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            config.api.token_url.clone(),
            Credential::new(config.api.client_id.clone(), config.api.client_secret.clone()),
            chrono::Duration::seconds(config.api.token_expiry_margin_secs),
        ));

        Ok(Self {
            config,
            http,
            tokens,
        })
    }

    /// S3 upload followed by a Postgres load, wired from configuration.
    pub async fn landing_sink(config: &Config, pool: PgPool) -> Result<Arc<dyn IngestionSink>> {
        let loader = PostgresLoader::new(pool);
        info!("Performing health checks");
        loader.health_check().await?;

        let blobs = S3BlobStore::new(
            config.storage.s3_bucket.clone(),
            config.storage.aws_profile.clone(),
            config.storage.aws_region.clone(),
        )
        .await;

        Ok(Arc::new(LandingSink::new(
            Arc::new(blobs),
            Arc::new(loader),
            config.storage.blob_prefix.clone(),
            config.storage.archive_raw,
        )))
    }

    fn source(&self, budget: Arc<RequestBudget>) -> Arc<dyn PageSource> {
        Arc::new(PageFetcher::new(
            self.http.clone(),
            self.config.api.listings_url.clone(),
            Arc::clone(&self.tokens),
            budget,
            self.config.fetch.page_size,
            Duration::from_millis(self.config.fetch.request_delay_ms),
        ))
    }

    /// Fetches the first token, retrying transport and 5xx failures.
    async fn warm_token(&self) -> Result<()> {
        retry_with_backoff(
            || self.tokens.ensure_valid_token(),
            Error::is_retryable,
            RetryPolicy::new(self.config.fetch.max_retries, self.config.fetch.retry_base_delay_ms),
            "token_exchange",
        )
        .await?;
        info!("Successfully fetched access token");
        Ok(())
    }

    fn log_soft_failures(report: &SweepReport) {
        for failure in &report.soft_failures {
            warn!(page = failure.page, reason = %failure.reason, "Page treated as empty");
        }
    }

    #[instrument(skip(self))]
    pub async fn run_count(&self) -> Result<u64> {
        self.warm_token().await?;
        let source = self.source(Arc::new(RequestBudget::new(self.config.fetch.request_budget)));
        source.fetch_total_count().await
    }

    #[instrument(skip(self, sink), fields(run_id = %Uuid::new_v4()))]
    pub async fn run_export(&self, sink: &dyn IngestionSink) -> Result<LandingReceipt> {
        self.warm_token().await?;

        let budget = Arc::new(RequestBudget::new(self.config.fetch.request_budget));
        let engine = PaginationEngine::new(self.source(Arc::clone(&budget)), self.config.fetch.concurrency);

        let report = engine.run_flat().await?;
        Self::log_soft_failures(&report);

        info!(
            records = report.records.len(),
            budget_consumed = budget.consumed(),
            budget_limit = budget.limit(),
            terminal = ?report.terminal,
            "Export sweep finished"
        );

        sink.land(&report.records, &self.config.warehouse.export_table).await
    }

    /// Sweeps one or more consecutive windows backwards in time, landing each
    /// window's records before starting the next. All windows share one budget.
    #[instrument(skip(self, sink), fields(run_id = %Uuid::new_v4()))]
    pub async fn run_backfill(
        &self,
        plan: BackfillPlan,
        sink: &dyn IngestionSink,
    ) -> Result<Vec<LandingReceipt>> {
        let mut window = plan.first_window()?;
        if !window.is_open() {
            return Err(Error::Validation(format!(
                "backfill window is empty: before {} is not later than after {}",
                window.before, window.after
            )));
        }

        self.warm_token().await?;

        let budget = Arc::new(RequestBudget::new(self.config.fetch.request_budget));
        let engine = PaginationEngine::new(self.source(Arc::clone(&budget)), 1);

        let filter: Option<Box<RecordFilter>> = plan.contact_email.clone().map(|email| {
            Box::new(move |record: &Record| contact_email(record) == Some(email.as_str()))
                as Box<RecordFilter>
        });

        let mut receipts = Vec::new();

        for index in 0..plan.max_windows.max(1) {
            info!(
                window = index + 1,
                before = %window.before,
                after = %window.after,
                "Fetching data for window"
            );

            let report = engine.run_windowed(window, filter.as_deref()).await?;
            Self::log_soft_failures(&report);

            receipts.push(
                sink.land(&report.records, &self.config.warehouse.backfill_table)
                    .await?,
            );

            match next_window(window, &report, plan.days) {
                Some(next) => window = next,
                None => {
                    info!(terminal = ?report.terminal, "Backfill stopped");
                    break;
                }
            }
        }

        info!(
            windows = receipts.len(),
            budget_consumed = budget.consumed(),
            "Backfill finished"
        );

        Ok(receipts)
    }
}
