//! Transfer processors.
//!
//! A [`TransferProcessor`] fronts one traffic class (upload, download, and
//! their LAN variants) and owns that class's main [`RateBudget`]. Registering
//! a connection creates the direction entity and places it on one scheduler
//! of the class's pool; index 0 is the default scheduler, and a non-negative
//! partition hint maps deterministically onto the remaining indices so
//! connections sharing a hint land together.
//!
//! All registration operations are idempotent: registering twice, or
//! deregistering a connection that was never registered, is a no-op.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use swarmnet_rate::RateBudget;

use crate::connection::{Connection, ConnectionId, ReadEntity, WriteEntity};
use crate::rates::TrafficClass;
use crate::scheduler::{IoScheduler, RateControlled, SchedulerDirection};

struct ProcessorEntry {
    scheduler_index: usize,
    entity: Arc<dyn RateControlled>,
    /// Shared with the scheduler entry; pushing a limiter here takes effect
    /// on the entity's next cycle.
    budgets: Arc<RwLock<Vec<Arc<RateBudget>>>>,
}

/// Rate-controlled registration front for one traffic class.
pub(crate) struct TransferProcessor {
    class: TrafficClass,
    direction: SchedulerDirection,
    main_budget: Arc<RateBudget>,
    pool: Vec<Arc<IoScheduler>>,
    registry: DashMap<ConnectionId, ProcessorEntry>,
}

impl TransferProcessor {
    pub(crate) fn new(
        class: TrafficClass,
        direction: SchedulerDirection,
        main_budget: Arc<RateBudget>,
        pool: Vec<Arc<IoScheduler>>,
    ) -> Self {
        debug_assert!(!pool.is_empty());
        Self {
            class,
            direction,
            main_budget,
            pool,
            registry: DashMap::new(),
        }
    }

    /// Scheduler index for a partition hint. Index 0 is reserved for
    /// unpartitioned connections; hints spread over the remaining indices.
    fn target_index(&self, partition_id: i32) -> usize {
        if self.pool.len() == 1 || partition_id < 0 {
            0
        } else {
            (partition_id as usize % (self.pool.len() - 1)) + 1
        }
    }

    /// Put the connection's direction entity under rate control. No-op if
    /// already registered.
    pub(crate) fn register(&self, conn: &Arc<Connection>) {
        match self.registry.entry(conn.id()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                let entity: Arc<dyn RateControlled> = match self.direction {
                    SchedulerDirection::Read => ReadEntity::new(Arc::clone(conn)),
                    SchedulerDirection::Write => WriteEntity::new(Arc::clone(conn)),
                };
                let index = self.target_index(conn.partition_id());
                let budgets = Arc::new(RwLock::new(vec![Arc::clone(&self.main_budget)]));
                self.pool[index].insert(Arc::clone(&entity), Arc::clone(&budgets));
                slot.insert(ProcessorEntry {
                    scheduler_index: index,
                    entity,
                    budgets,
                });
                tracing::trace!(
                    class = ?self.class,
                    conn = %conn.id(),
                    scheduler = index,
                    "connection registered"
                );
            }
        }
    }

    /// Take the connection out of rate control. Returns whether it was
    /// registered; the map entry and the scheduler entry are removed under
    /// the same shard lock so a concurrent [`TransferProcessor::is_registered`]
    /// never observes a half-removed connection.
    pub(crate) fn deregister(&self, id: ConnectionId) -> bool {
        match self.registry.entry(id) {
            Entry::Occupied(occupied) => {
                let entry = occupied.remove();
                self.pool[entry.scheduler_index].remove(id);
                tracing::trace!(class = ?self.class, conn = %id, "connection deregistered");
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub(crate) fn is_registered(&self, id: ConnectionId) -> bool {
        self.registry.contains_key(&id)
    }

    /// Move a registered connection onto the scheduler selected by the given
    /// partition hint. No-op when unregistered or already there.
    pub(crate) fn upgrade(&self, conn: &Arc<Connection>, partition_id: i32) {
        conn.set_partition_id(partition_id);
        self.move_to(conn.id(), self.target_index(partition_id));
    }

    /// Move a registered connection back onto the default scheduler.
    pub(crate) fn downgrade(&self, conn: &Arc<Connection>) {
        conn.set_partition_id(-1);
        self.move_to(conn.id(), 0);
    }

    /// Relocate between schedulers under the registry shard lock, so the
    /// entity is never observably on zero or two schedulers.
    fn move_to(&self, id: ConnectionId, new_index: usize) {
        if let Entry::Occupied(mut occupied) = self.registry.entry(id) {
            let entry = occupied.get_mut();
            if entry.scheduler_index == new_index {
                return;
            }
            self.pool[entry.scheduler_index].remove(id);
            self.pool[new_index].insert(Arc::clone(&entry.entity), Arc::clone(&entry.budgets));
            let old = entry.scheduler_index;
            entry.scheduler_index = new_index;
            tracing::trace!(
                class = ?self.class,
                conn = %id,
                from = old,
                to = new_index,
                "connection moved"
            );
        }
    }

    /// Attach a supplementary budget to a registered connection. The entity's
    /// per-cycle allowance becomes the minimum across all attached budgets.
    /// No-op when unregistered or when the budget is already attached.
    pub(crate) fn add_rate_limiter(&self, id: ConnectionId, budget: Arc<RateBudget>) {
        if let Some(entry) = self.registry.get(&id) {
            let mut budgets = entry
                .budgets
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if !budgets.iter().any(|b| Arc::ptr_eq(b, &budget)) {
                budgets.push(budget);
            }
        }
    }

    /// Detach a supplementary budget. No-op when unregistered or not
    /// attached; the class's main budget cannot be detached.
    pub(crate) fn remove_rate_limiter(&self, id: ConnectionId, budget: &Arc<RateBudget>) {
        if Arc::ptr_eq(budget, &self.main_budget) {
            return;
        }
        if let Some(entry) = self.registry.get(&id) {
            entry
                .budgets
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|b| !Arc::ptr_eq(b, budget));
        }
    }

    /// Budgets currently attached to a connection, main budget included.
    #[cfg(test)]
    fn limiter_count(&self, id: ConnectionId) -> usize {
        self.registry
            .get(&id)
            .map(|e| {
                e.budgets
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
            .unwrap_or(0)
    }
}
