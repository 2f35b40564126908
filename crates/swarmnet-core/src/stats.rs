//! Process-wide transfer statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters maintained by the scheduler pools and the admission
/// registry. Cheap to update from any loop; read via [`NetworkStats::snapshot`].
#[derive(Debug, Default)]
pub struct NetworkStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections_routed: AtomicU64,
    connections_dropped: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStatsSnapshot {
    /// Total payload bytes written to peer sockets.
    pub bytes_sent: u64,
    /// Total payload bytes read from peer sockets.
    pub bytes_received: u64,
    /// Inbound connections successfully routed to a protocol owner.
    pub connections_routed: u64,
    /// Inbound connections dropped (no match, timeout or read error).
    pub connections_dropped: u64,
}

impl NetworkStats {
    pub(crate) fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_connection_routed(&self) {
        self.connections_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_connection_dropped(&self) {
        self.connections_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy out the current counter values.
    pub fn snapshot(&self) -> NetworkStatsSnapshot {
        NetworkStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_routed: self.connections_routed.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
        }
    }
}
