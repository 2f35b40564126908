//! Rate-limited I/O schedulers.
//!
//! An [`IoScheduler`] owns a set of registered [`RateControlled`] entities
//! and drives them from a single spawned task. Each cycle it services the
//! entities starting at a rotating cursor (so no entity is persistently
//! favored), computes each entity's allowance as the minimum instantaneous
//! headroom across its attached budgets, and asks the entity to perform one
//! bounded non-blocking operation. Bytes actually moved are debited from
//! every attached budget and credited to the process-wide statistics.
//!
//! An entity whose allowance is exhausted, or whose socket is not ready,
//! simply moves nothing this cycle and is retried on the next one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use swarmnet_rate::RateBudget;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::ConnectionId;
use crate::stats::NetworkStats;

/// Cycle interval of the scheduler loop.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on a single entity operation, independent of budget headroom.
const MAX_OP_QUANTUM: usize = 64 * 1024;

/// One rate-controlled I/O participant (one direction of one connection).
pub(crate) trait RateControlled: Send + Sync {
    /// Owning connection, used as the registration key.
    fn id(&self) -> ConnectionId;

    /// Perform at most one bounded non-blocking operation moving up to
    /// `allowance` bytes. Returns bytes actually moved; transport failures
    /// are reported to the connection's owner internally and show up here as
    /// zero.
    fn process(&self, allowance: usize) -> usize;
}

/// Direction serviced by a scheduler, for stats attribution and naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedulerDirection {
    Read,
    Write,
}

#[derive(Clone)]
pub(crate) struct SchedulerEntry {
    pub(crate) entity: Arc<dyn RateControlled>,
    /// Shared with the owning transfer processor so supplementary limiters
    /// attach without touching the scheduler.
    pub(crate) budgets: Arc<RwLock<Vec<Arc<RateBudget>>>>,
}

/// One instance of the non-blocking I/O readiness loop.
pub(crate) struct IoScheduler {
    name: String,
    direction: SchedulerDirection,
    entries: Mutex<Vec<SchedulerEntry>>,
    /// Rotating start offset for fair servicing.
    cursor: AtomicUsize,
    stopped: AtomicBool,
    stats: Arc<NetworkStats>,
}

impl IoScheduler {
    pub(crate) fn new(
        direction: SchedulerDirection,
        index: usize,
        stats: Arc<NetworkStats>,
    ) -> Arc<Self> {
        let name = match direction {
            SchedulerDirection::Read => format!("read-{index}"),
            SchedulerDirection::Write => format!("write-{index}"),
        };
        Arc::new(Self {
            name,
            direction,
            entries: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            stats,
        })
    }

    /// Register an entity. Replaces any existing registration for the same
    /// connection, so a re-insert never double-registers.
    pub(crate) fn insert(
        &self,
        entity: Arc<dyn RateControlled>,
        budgets: Arc<RwLock<Vec<Arc<RateBudget>>>>,
    ) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = entity.id();
        entries.retain(|e| e.entity.id() != id);
        entries.push(SchedulerEntry { entity, budgets });
    }

    /// Deregister by connection. Returns whether anything was removed.
    pub(crate) fn remove(&self, id: ConnectionId) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.entity.id() != id);
        entries.len() != before
    }

    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.entity.id() == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Service every registered entity once. `now` stamps budget refills for
    /// the whole cycle. Returns total bytes moved.
    pub(crate) fn run_cycle(&self, now: Instant) -> usize {
        let entries: Vec<SchedulerEntry> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if entries.is_empty() {
            return 0;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % entries.len();
        let mut total = 0usize;
        for offset in 0..entries.len() {
            let entry = &entries[(start + offset) % entries.len()];
            let budgets = entry
                .budgets
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let allowance = budgets
                .iter()
                .map(|b| b.available(now))
                .min()
                .unwrap_or(usize::MAX)
                .min(MAX_OP_QUANTUM);
            if allowance == 0 {
                continue; // exhausted this cycle; retried next tick
            }
            let moved = entry.entity.process(allowance);
            if moved > 0 {
                for budget in budgets.iter() {
                    budget.consume(moved);
                }
                match self.direction {
                    SchedulerDirection::Read => self.stats.add_bytes_received(moved as u64),
                    SchedulerDirection::Write => self.stats.add_bytes_sent(moved as u64),
                }
                total += moved;
            }
        }
        total
    }

    /// Spawn the scheduler loop. The task runs until [`IoScheduler::shutdown`].
    pub(crate) fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(scheduler = %scheduler.name, "scheduler loop started");
            loop {
                tick.tick().await;
                if scheduler.stopped.load(Ordering::Relaxed) {
                    break;
                }
                scheduler.run_cycle(Instant::now());
            }
            tracing::debug!(scheduler = %scheduler.name, "scheduler loop stopped");
        })
    }

    pub(crate) fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
