use crate::fetch::PageSource;
use crate::model::{oldest_published, Page, PageOutcome, PageRequest, Record, SoftFailure, TimeWindow};
use chrono::{DateTime, Utc};
use listings_core::{Error, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Caller-supplied predicate applied to windowed results before aggregation.
pub type RecordFilter = dyn Fn(&Record) -> bool + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Planning,
    Fetching,
    /// Budget spent or run aborting; in-flight pages are finishing.
    Draining,
    Complete,
    /// No more data in the window.
    Exhausted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTerminal {
    /// Every planned page was dispatched and finished.
    Complete,
    BudgetExhausted,
    /// Windowed mode received an empty page.
    NoMoreData,
    /// Windowed mode narrowed the window down to its lower bound.
    WindowConsumed,
    /// Windowed mode could not advance the window from the page's timestamps.
    WindowStalled,
    /// Windowed mode got a failed page; `[after, oldest_published)` is still unfetched.
    PageFailed,
}

#[derive(Debug, Clone)]
pub struct SweepReport {
    /// Completion order in flat mode, fetch order (newest first) in windowed mode.
    pub records: Vec<Record>,
    pub soft_failures: Vec<SoftFailure>,
    pub pages_fetched: u32,
    pub pages_refused: u32,
    /// Records received before filtering.
    pub records_seen: usize,
    pub oldest_published: Option<DateTime<Utc>>,
    pub terminal: SweepTerminal,
}

impl SweepReport {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            soft_failures: Vec::new(),
            pages_fetched: 0,
            pages_refused: 0,
            records_seen: 0,
            oldest_published: None,
            terminal: SweepTerminal::Complete,
        }
    }

    /// Books the page outcome and returns its records.
    fn absorb(&mut self, page: Page) -> Vec<Record> {
        match page.outcome {
            PageOutcome::Ok => self.pages_fetched += 1,
            PageOutcome::BudgetExhausted => self.pages_refused += 1,
            PageOutcome::SoftFailure(reason) => self.soft_failures.push(SoftFailure {
                page: page.request.page,
                reason,
            }),
        }
        self.records_seen += page.records.len();
        page.records
    }
}

/// `min(remaining budget, ceil(total_count / page_size))`, saturated to the page-number range.
pub fn plan_page_count(total_count: u64, page_size: u32, remaining_budget: u64) -> u32 {
    if page_size == 0 {
        return 0;
    }
    let pages = total_count.div_ceil(page_size as u64).min(remaining_budget);
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Window for the next backfill step, or `None` when the driver should stop.
///
/// The next upper bound is the oldest timestamp the previous sweep observed,
/// or the previous lower bound if it saw nothing. A sweep cut short by a failed
/// page resumes the same window from where it stopped.
pub fn next_window(previous: TimeWindow, report: &SweepReport, days: i64) -> Option<TimeWindow> {
    match report.terminal {
        SweepTerminal::BudgetExhausted | SweepTerminal::WindowStalled => None,
        SweepTerminal::PageFailed => {
            let before = report
                .oldest_published
                .map_or(previous.before, |oldest| oldest.min(previous.before));
            Some(TimeWindow::new(before, previous.after)).filter(TimeWindow::is_open)
        }
        SweepTerminal::Complete | SweepTerminal::NoMoreData | SweepTerminal::WindowConsumed => {
            let before = report
                .oldest_published
                .map_or(previous.after, |oldest| oldest.min(previous.after));
            TimeWindow::spanning_days(before, days).ok()
        }
    }
}

pub struct PaginationEngine {
    source: Arc<dyn PageSource>,
    concurrency: usize,
}

impl PaginationEngine {
    pub fn new(source: Arc<dyn PageSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
        }
    }

    fn enter(phase: &mut RunPhase, next: RunPhase) {
        debug!(from = ?*phase, to = ?next, "Engine phase change");
        *phase = next;
    }

    fn spawn_page(&self, tasks: &mut JoinSet<Result<Page>>, page: u32) {
        let source = Arc::clone(&self.source);
        tasks.spawn(async move { source.fetch_page(PageRequest::page(page)).await });
    }

    /// Bulk export: count, plan, then fetch pages `1..=max_pages` on a bounded worker pool.
    ///
    /// Once the budget is spent no further page is launched; pages already in
    /// flight still finish and their records are kept.
    #[instrument(skip(self))]
    pub async fn run_flat(&self) -> Result<SweepReport> {
        let mut phase = RunPhase::Planning;
        let mut report = SweepReport::new();
        let budget = self.source.budget();

        let total_count = self.source.fetch_total_count().await?;
        let max_pages = plan_page_count(total_count, self.source.page_size(), budget.remaining());

        info!(
            total_count,
            max_pages,
            concurrency = self.concurrency,
            budget_remaining = budget.remaining(),
            "Fetching up to {} pages of data",
            max_pages
        );

        if max_pages == 0 {
            report.terminal = if budget.is_exhausted() {
                SweepTerminal::BudgetExhausted
            } else {
                SweepTerminal::Complete
            };
            Self::enter(&mut phase, RunPhase::Done);
            return Ok(report);
        }

        Self::enter(&mut phase, RunPhase::Fetching);

        let mut tasks = JoinSet::new();
        let mut next_page = 1u32;
        while next_page <= max_pages && tasks.len() < self.concurrency {
            self.spawn_page(&mut tasks, next_page);
            next_page += 1;
        }

        let mut failure: Option<Error> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(page)) => {
                    let records = report.absorb(page);
                    report.records.extend(records);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Page fetch aborted the run");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(Error::Internal(format!("page task panicked: {e}")));
                }
            }

            if phase == RunPhase::Fetching && next_page <= max_pages {
                if failure.is_some() || budget.is_exhausted() {
                    warn!(
                        pending = max_pages - next_page + 1,
                        in_flight = tasks.len(),
                        "Stopping dispatch, draining in-flight pages"
                    );
                    Self::enter(&mut phase, RunPhase::Draining);
                } else {
                    self.spawn_page(&mut tasks, next_page);
                    next_page += 1;
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        report.terminal = if next_page <= max_pages || report.pages_refused > 0 {
            SweepTerminal::BudgetExhausted
        } else {
            SweepTerminal::Complete
        };
        report.oldest_published = oldest_published(&report.records);

        if phase == RunPhase::Fetching {
            Self::enter(&mut phase, RunPhase::Complete);
        }
        Self::enter(&mut phase, RunPhase::Done);

        info!(
            records = report.records.len(),
            pages_fetched = report.pages_fetched,
            soft_failures = report.soft_failures.len(),
            terminal = ?report.terminal,
            "Total records fetched: {}",
            report.records.len()
        );

        Ok(report)
    }

    /// Backward scan of one window: always page 1, narrowing `before` to the
    /// oldest `published_at` seen so far until the window closes.
    #[instrument(skip(self, filter), fields(before = %window.before, after = %window.after))]
    pub async fn run_windowed(
        &self,
        window: TimeWindow,
        filter: Option<&RecordFilter>,
    ) -> Result<SweepReport> {
        let mut phase = RunPhase::Planning;
        let mut report = SweepReport::new();
        let mut current_before = window.before;

        report.terminal = SweepTerminal::WindowConsumed;
        Self::enter(&mut phase, RunPhase::Fetching);

        while current_before > window.after {
            debug!(before = %current_before, "Fetching data before bound");

            let page = self
                .source
                .fetch_page(PageRequest::windowed(1, TimeWindow::new(current_before, window.after)))
                .await?;

            if page.outcome == PageOutcome::BudgetExhausted {
                report.absorb(page);
                report.terminal = SweepTerminal::BudgetExhausted;
                warn!("Request budget exhausted during windowed sweep");
                break;
            }

            if let PageOutcome::SoftFailure(reason) = &page.outcome {
                warn!(before = %current_before, reason = %reason, "Page failed, stopping sweep");
                report.absorb(page);
                report.terminal = SweepTerminal::PageFailed;
                break;
            }

            let records = report.absorb(page);
            if records.is_empty() {
                info!(before = %current_before, "No more older records available");
                report.terminal = SweepTerminal::NoMoreData;
                Self::enter(&mut phase, RunPhase::Exhausted);
                break;
            }

            let oldest = oldest_published(&records);
            report
                .records
                .extend(records.into_iter().filter(|record| filter.map_or(true, |keep| keep(record))));

            match oldest {
                Some(oldest) if oldest < current_before => {
                    current_before = oldest;
                    report.oldest_published = Some(oldest);
                }
                stalled => {
                    warn!(
                        before = %current_before,
                        oldest = ?stalled,
                        "Window did not advance, stopping sweep"
                    );
                    report.terminal = SweepTerminal::WindowStalled;
                    break;
                }
            }
        }

        if report.terminal == SweepTerminal::WindowConsumed {
            info!(after = %window.after, "Reached the lower bound of the window");
            Self::enter(&mut phase, RunPhase::Complete);
        }
        Self::enter(&mut phase, RunPhase::Done);

        info!(
            records = report.records.len(),
            records_seen = report.records_seen,
            pages_fetched = report.pages_fetched,
            terminal = ?report.terminal,
            "Total records fetched after filtering: {}",
            report.records.len()
        );

        Ok(report)
    }
}
