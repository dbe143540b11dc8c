//! Budget tracker: a hard spending ceiling shared by every chunk worker.
//!
//! The tracker is the only mutable state shared across workers, so it sits
//! behind a single [`Mutex`]. The check and the reservation happen under one
//! lock acquisition, which is what keeps concurrent workers from jointly
//! overshooting the ceiling.
//!
//! A successful [`BudgetTracker::reserve`] returns a [`Reservation`] guard.
//! Settling consumes it; dropping it unsettled settles with zero, so every
//! reservation is released exactly once even on early returns and
//! cancellation.

use crate::error::ChunkError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

/// Snapshot of the tracker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// Monotonically increasing measured spend.
    pub spent: f64,
    /// Estimated cost of calls currently in flight.
    pub reserved: f64,
    /// Hard ceiling; `<= 0` means unlimited.
    pub ceiling: f64,
}

impl BudgetState {
    pub fn is_unlimited(&self) -> bool {
        self.ceiling <= 0.0
    }

    /// Headroom left for new reservations (`f64::INFINITY` when unlimited).
    pub fn available(&self) -> f64 {
        if self.is_unlimited() {
            f64::INFINITY
        } else {
            (self.ceiling - self.spent - self.reserved).max(0.0)
        }
    }

    fn admits(&self, cost: f64) -> bool {
        self.is_unlimited() || self.spent + self.reserved + cost <= self.ceiling
    }
}

/// Mutex-guarded spend accounting for one document run.
#[derive(Debug)]
pub struct BudgetTracker {
    state: Mutex<BudgetState>,
}

impl BudgetTracker {
    /// Create a tracker. A ceiling `<= 0` (or non-finite) disables enforcement.
    pub fn new(ceiling: f64) -> Self {
        let ceiling = if ceiling.is_finite() { ceiling } else { 0.0 };
        Self {
            state: Mutex::new(BudgetState {
                spent: 0.0,
                reserved: 0.0,
                ceiling,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        // A poisoned lock only means another worker panicked mid-update of
        // plain numbers; the counters are still meaningful.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn snapshot(&self) -> BudgetState {
        *self.lock()
    }

    /// Fail with [`ChunkError::BudgetExceeded`] if `cost` would not fit.
    ///
    /// Advisory only: another worker may reserve in between. Use
    /// [`BudgetTracker::reserve`] before an actual call.
    pub fn ensure_available(&self, cost: f64) -> Result<(), ChunkError> {
        let state = self.lock();
        if state.admits(cost.max(0.0)) {
            Ok(())
        } else {
            Err(ChunkError::BudgetExceeded {
                needed: cost,
                available: state.available(),
            })
        }
    }

    /// Atomically check and reserve `cost`.
    ///
    /// On failure the state is left untouched.
    pub fn reserve(&self, cost: f64) -> Result<Reservation<'_>, ChunkError> {
        let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
        let mut state = self.lock();
        if !state.admits(cost) {
            debug!(
                "Budget: refusing ${:.6} (spent {:.6}, reserved {:.6}, ceiling {:.6})",
                cost, state.spent, state.reserved, state.ceiling
            );
            return Err(ChunkError::BudgetExceeded {
                needed: cost,
                available: state.available(),
            });
        }
        state.reserved += cost;
        Ok(Reservation {
            tracker: self,
            amount: cost,
            settled: false,
        })
    }

    fn settle_amount(&self, reserved: f64, actual: f64) {
        let actual = if actual.is_finite() { actual.max(0.0) } else { 0.0 };
        let mut state = self.lock();
        state.reserved = (state.reserved - reserved).max(0.0);
        state.spent += actual;
    }
}

/// An outstanding reservation. Settle it with the measured cost.
#[derive(Debug)]
#[must_use = "dropping a reservation settles it with zero cost"]
pub struct Reservation<'a> {
    tracker: &'a BudgetTracker,
    amount: f64,
    settled: bool,
}

impl Reservation<'_> {
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Move the reservation into spent, recording `actual` as the real cost.
    pub fn settle(mut self, actual: f64) {
        self.settled = true;
        self.tracker.settle_amount(self.amount, actual);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.settle_amount(self.amount, 0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reserve_then_settle_moves_cost_to_spent() {
        let b = BudgetTracker::new(1.0);
        let r = b.reserve(0.4).unwrap();
        assert_eq!(b.snapshot().reserved, 0.4);
        r.settle(0.3);
        let s = b.snapshot();
        assert_eq!(s.reserved, 0.0);
        assert!((s.spent - 0.3).abs() < 1e-12);
    }

    #[test]
    fn over_ceiling_fails_and_leaves_state_unchanged() {
        let b = BudgetTracker::new(1.0);
        let _held = b.reserve(0.8).unwrap();
        let before = b.snapshot();
        let err = b.reserve(0.3).unwrap_err();
        assert!(matches!(err, ChunkError::BudgetExceeded { .. }));
        assert_eq!(b.snapshot(), before);
        assert!(b.ensure_available(0.3).is_err());
        assert!(b.ensure_available(0.2).is_ok());
    }

    #[test]
    fn dropped_reservation_is_released() {
        let b = BudgetTracker::new(1.0);
        {
            let _r = b.reserve(0.9).unwrap();
        }
        let s = b.snapshot();
        assert_eq!(s.reserved, 0.0);
        assert_eq!(s.spent, 0.0);
    }

    #[test]
    fn non_positive_ceiling_is_unlimited() {
        let b = BudgetTracker::new(0.0);
        b.reserve(1e9).unwrap().settle(1e9);
        assert!(b.snapshot().is_unlimited());
        assert!(BudgetTracker::new(-5.0).ensure_available(1e12).is_ok());
    }

    #[test]
    fn concurrent_reservations_never_exceed_ceiling() {
        let b = Arc::new(BudgetTracker::new(1.0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let b = Arc::clone(&b);
            handles.push(std::thread::spawn(move || {
                let mut granted = 0;
                for _ in 0..200 {
                    if let Ok(r) = b.reserve(0.01) {
                        let s = b.snapshot();
                        assert!(s.spent + s.reserved <= s.ceiling + 1e-9);
                        granted += 1;
                        r.settle(0.0);
                    }
                }
                granted
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total > 0);
        let s = b.snapshot();
        assert!(s.reserved.abs() < 1e-9, "reserved {}", s.reserved);
        assert!(s.spent + s.reserved <= s.ceiling);
    }

    #[test]
    fn concurrent_spend_stops_at_ceiling() {
        let b = Arc::new(BudgetTracker::new(0.5));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || {
                    while let Ok(r) = b.reserve(0.01) {
                        r.settle(0.01);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = b.snapshot();
        assert!(s.spent <= 0.5 + 1e-9, "spent {}", s.spent);
        assert!(s.spent >= 0.49 - 1e-9, "spent {}", s.spent);
    }
}
