//! Wall-clock budget enforced through the QuickJS interrupt handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const DISARMED: u64 = 0;

/// Deadline shared between the worker and the runtime's interrupt handler.
///
/// The worker arms it around every entry into guest code. QuickJS polls the
/// handler while executing; once the deadline has passed the handler returns
/// `true`, which raises an uncatchable interrupt in the running script.
#[derive(Debug)]
pub(crate) struct ExecutionBudget {
    origin: Instant,
    /// Nanoseconds since `origin`, or `DISARMED`.
    deadline: AtomicU64,
    tripped: AtomicBool,
}

impl ExecutionBudget {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            deadline: AtomicU64::new(DISARMED),
            tripped: AtomicBool::new(false),
        })
    }

    /// Start a budget of `limit` from now and clear any previous trip.
    pub(crate) fn arm(&self, limit: Duration) {
        let at = self.origin.elapsed().saturating_add(limit);
        let nanos = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX).max(1);
        self.tripped.store(false, Ordering::SeqCst);
        self.deadline.store(nanos, Ordering::SeqCst);
    }

    pub(crate) fn disarm(&self) {
        self.deadline.store(DISARMED, Ordering::SeqCst);
    }

    /// Whether the last armed budget ran out.
    pub(crate) fn tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Interrupt handler body.
    pub(crate) fn should_interrupt(&self) -> bool {
        let deadline = self.deadline.load(Ordering::SeqCst);
        if deadline == DISARMED {
            return false;
        }
        let now = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        if now >= deadline {
            self.tripped.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disarmed_never_interrupts() {
        let budget = ExecutionBudget::new();
        assert!(!budget.should_interrupt());
        assert!(!budget.tripped());
    }

    #[test]
    fn test_expired_budget_trips() {
        let budget = ExecutionBudget::new();
        budget.arm(Duration::ZERO);
        assert!(budget.should_interrupt());
        assert!(budget.tripped());

        budget.arm(Duration::from_secs(60));
        assert!(!budget.tripped());
        assert!(!budget.should_interrupt());

        budget.disarm();
        assert!(!budget.should_interrupt());
    }
}
