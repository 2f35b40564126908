//! # swarmnet-rate
//!
//! Shared bandwidth budgets for the swarmnet scheduling core.
//!
//! This crate provides:
//! - The [`RateGroup`] trait: a named, live-queryable byte-per-second ceiling
//! - The [`RateBudget`] token bucket that meters traffic against a group
//! - The [`UNLIMITED_RATE`] sentinel that disables throttling entirely
//!
//! A budget is shared: any number of connections (and any number of scheduler
//! instances) may draw from the same [`RateBudget`]. Schedulers query the
//! instantaneous allowance with [`RateBudget::available`] before performing a
//! bounded I/O operation and debit the bytes actually moved with
//! [`RateBudget::consume`]. The ceiling itself is re-read from the group on
//! every refill, so configuration changes take effect without recreating the
//! budget.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Rate ceiling treated as "no limit" (100 MiB/s, matching the engine-wide
/// sentinel). Any group reporting this value or higher is not throttled.
pub const UNLIMITED_RATE: u32 = 100 * 1024 * 1024;

/// A named byte-per-second ceiling that one or more connections draw from.
///
/// Implementations report the *current* ceiling on every call; the value is
/// derived from live configuration, never fixed at creation.
pub trait RateGroup: Send + Sync {
    /// Human-readable group name, used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Current ceiling in bytes per second. Values at or above
    /// [`UNLIMITED_RATE`] disable throttling for this group.
    fn rate_limit_bytes_per_second(&self) -> u32;
}

/// A fixed-rate group, mostly useful for supplementary per-download or
/// per-category limits whose ceiling does not track global configuration.
pub struct FixedRateGroup {
    name: String,
    limit: AtomicU64,
}

impl FixedRateGroup {
    /// Create a group with the given name and ceiling in bytes per second.
    pub fn new(name: impl Into<String>, limit_bytes_per_second: u32) -> Self {
        Self {
            name: name.into(),
            limit: AtomicU64::new(u64::from(limit_bytes_per_second)),
        }
    }

    /// Replace the ceiling. Takes effect on the next budget refill.
    pub fn set_limit(&self, limit_bytes_per_second: u32) {
        self.limit
            .store(u64::from(limit_bytes_per_second), Ordering::Relaxed);
    }
}

impl RateGroup for FixedRateGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn rate_limit_bytes_per_second(&self) -> u32 {
        self.limit.load(Ordering::Relaxed) as u32
    }
}

struct BucketState {
    /// Bytes currently claimable. Fractional accumulation keeps long-term
    /// throughput exact at low rates and short cycle intervals.
    available: f64,
    last_refill: Instant,
}

/// Token bucket metering traffic against a [`RateGroup`] ceiling.
///
/// The bucket refills continuously (allowance accrues with elapsed time, not
/// in discrete one-second steps) and caps the accumulated burst at one second
/// of the current ceiling. When the group reports [`UNLIMITED_RATE`] the
/// bucket short-circuits: [`RateBudget::available`] returns `usize::MAX` and
/// [`RateBudget::consume`] only updates the consumption counter.
pub struct RateBudget {
    group: std::sync::Arc<dyn RateGroup>,
    state: Mutex<BucketState>,
    total_consumed: AtomicU64,
}

impl RateBudget {
    /// Create a budget drawing against the given group, starting with a full
    /// one-second allowance.
    pub fn new(group: std::sync::Arc<dyn RateGroup>) -> Self {
        let limit = group.rate_limit_bytes_per_second();
        Self {
            group,
            state: Mutex::new(BucketState {
                available: f64::from(limit.min(UNLIMITED_RATE)),
                last_refill: Instant::now(),
            }),
            total_consumed: AtomicU64::new(0),
        }
    }

    /// The group this budget draws from.
    pub fn group(&self) -> &std::sync::Arc<dyn RateGroup> {
        &self.group
    }

    /// Group name, for logs.
    pub fn name(&self) -> &str {
        self.group.name()
    }

    /// Whether the group currently reports an unlimited ceiling.
    pub fn is_unlimited(&self) -> bool {
        self.group.rate_limit_bytes_per_second() >= UNLIMITED_RATE
    }

    /// Bytes that may be transferred right now without exceeding the ceiling.
    ///
    /// `now` is supplied by the caller so scheduler cycles can share one
    /// timestamp across all budgets (and so tests can drive synthetic time).
    pub fn available(&self, now: Instant) -> usize {
        let limit = self.group.rate_limit_bytes_per_second();
        if limit >= UNLIMITED_RATE {
            return usize::MAX;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now
            .checked_duration_since(state.last_refill)
            .unwrap_or_default();
        state.last_refill = now;
        // Burst cap: at most one second of allowance may accumulate. A ceiling
        // lowered at runtime also shrinks an already-accumulated allowance.
        state.available =
            (state.available + elapsed.as_secs_f64() * f64::from(limit)).min(f64::from(limit));
        state.available as usize
    }

    /// Debit bytes actually transferred.
    pub fn consume(&self, bytes: usize) {
        self.total_consumed
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if self.is_unlimited() {
            return;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.available = (state.available - bytes as f64).max(0.0);
    }

    /// Total bytes ever debited from this budget.
    pub fn total_consumed(&self) -> u64 {
        self.total_consumed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RateBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateBudget")
            .field("group", &self.group.name())
            .field("limit", &self.group.rate_limit_bytes_per_second())
            .field("total_consumed", &self.total_consumed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fixed_group_reports_limit() {
        let group = FixedRateGroup::new("test", 4096);
        assert_eq!(group.name(), "test");
        assert_eq!(group.rate_limit_bytes_per_second(), 4096);
        group.set_limit(8192);
        assert_eq!(group.rate_limit_bytes_per_second(), 8192);
    }

    #[test]
    fn budget_starts_with_one_second_allowance() {
        let budget = RateBudget::new(Arc::new(FixedRateGroup::new("g", 10_000)));
        let now = Instant::now();
        assert_eq!(budget.available(now), 10_000);
    }

    #[test]
    fn consume_debits_allowance() {
        let budget = RateBudget::new(Arc::new(FixedRateGroup::new("g", 10_000)));
        let now = Instant::now();
        assert_eq!(budget.available(now), 10_000);
        budget.consume(4_000);
        assert_eq!(budget.available(now), 6_000);
        assert_eq!(budget.total_consumed(), 4_000);
    }

    #[test]
    fn refill_accrues_with_elapsed_time() {
        let budget = RateBudget::new(Arc::new(FixedRateGroup::new("g", 10_000)));
        let now = Instant::now();
        budget.available(now);
        budget.consume(10_000);
        assert_eq!(budget.available(now), 0);

        let later = now + Duration::from_millis(500);
        let avail = budget.available(later);
        assert!((4_900..=5_100).contains(&avail), "got {avail}");
    }

    #[test]
    fn burst_caps_at_one_second() {
        let budget = RateBudget::new(Arc::new(FixedRateGroup::new("g", 10_000)));
        let now = Instant::now();
        budget.available(now);
        // A long idle gap must not bank more than one second of allowance.
        let much_later = now + Duration::from_secs(60);
        assert_eq!(budget.available(much_later), 10_000);
    }

    #[test]
    fn unlimited_group_disables_throttling() {
        let budget = RateBudget::new(Arc::new(FixedRateGroup::new("g", UNLIMITED_RATE)));
        assert!(budget.is_unlimited());
        assert_eq!(budget.available(Instant::now()), usize::MAX);
        budget.consume(1_000_000);
        assert_eq!(budget.available(Instant::now()), usize::MAX);
        assert_eq!(budget.total_consumed(), 1_000_000);
    }

    #[test]
    fn lowered_ceiling_shrinks_banked_allowance() {
        let group = Arc::new(FixedRateGroup::new("g", 100_000));
        let budget = RateBudget::new(Arc::clone(&group) as Arc<dyn RateGroup>);
        let now = Instant::now();
        assert_eq!(budget.available(now), 100_000);
        group.set_limit(1_000);
        assert_eq!(budget.available(now), 1_000);
    }

    #[test]
    fn shared_budget_is_drained_by_all_holders() {
        let budget = Arc::new(RateBudget::new(Arc::new(FixedRateGroup::new("g", 9_000))));
        let a = Arc::clone(&budget);
        let b = Arc::clone(&budget);
        let now = Instant::now();
        a.available(now);
        a.consume(3_000);
        b.consume(3_000);
        assert_eq!(budget.available(now), 3_000);
    }

    proptest! {
        #[test]
        fn available_never_exceeds_ceiling(
            limit in 1024u32..1_000_000,
            draws in proptest::collection::vec(0usize..200_000, 0..32),
            gaps_ms in proptest::collection::vec(0u64..5_000, 0..32),
        ) {
            let budget = RateBudget::new(Arc::new(FixedRateGroup::new("p", limit)));
            let mut now = Instant::now();
            for (draw, gap) in draws.iter().zip(gaps_ms.iter()) {
                now += Duration::from_millis(*gap);
                let avail = budget.available(now);
                prop_assert!(avail <= limit as usize);
                budget.consume((*draw).min(avail));
            }
        }
    }
}
