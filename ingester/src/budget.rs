use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-run ceiling on outbound listing calls, shared by every fetch worker.
///
/// Admission is a single compare-and-increment, so concurrent workers can
/// never push `consumed` past `limit`.
#[derive(Debug)]
pub struct RequestBudget {
    consumed: AtomicU64,
    limit: u64,
}

impl RequestBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            consumed: AtomicU64::new(0),
            limit,
        }
    }

    /// Takes one unit if any is left. Refusal leaves the counter untouched.
    pub fn try_admit(&self) -> bool {
        let admitted = self
            .consumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |consumed| {
                (consumed < self.limit).then_some(consumed + 1)
            })
            .is_ok();

        if admitted {
            counter!("ingester_budget_admitted").increment(1);
        } else {
            counter!("ingester_budget_refused").increment(1);
        }

        admitted
    }

    /// Observational; use [`RequestBudget::try_admit`] to actually claim a unit.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.consumed())
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}
