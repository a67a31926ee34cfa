//! Driver statistics.
//!
//! [`DriverStats`] is the in-process recorder drivers feed from their event
//! hooks; [`StatsSource`] is the read side polled by the metrics bridge.

use std::sync::atomic::{AtomicI64, Ordering};

/// Point-in-time copy of the driver counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Live cluster (topology) objects.
    pub clusters: i64,
    /// Live connections to writable servers.
    pub master_conns: i64,
    /// Live connections to read-only servers.
    pub slave_conns: i64,
    /// Operations sent.
    pub sent_ops: i64,
    /// Replies received.
    pub received_ops: i64,
    /// Documents received in replies.
    pub received_docs: i64,
    /// Live sockets.
    pub sockets_alive: i64,
    /// Sockets checked out of the pool.
    pub sockets_in_use: i64,
    /// Outstanding socket references, including pending checkouts.
    pub socket_refs: i64,
}

impl Stats {
    /// Counters in export order.
    #[must_use]
    pub fn values(&self) -> [i64; 9] {
        [
            self.clusters,
            self.master_conns,
            self.slave_conns,
            self.sent_ops,
            self.received_ops,
            self.received_docs,
            self.sockets_alive,
            self.sockets_in_use,
            self.socket_refs,
        ]
    }

    /// Live sockets sitting idle in the pool.
    #[must_use]
    pub fn sockets_idle(&self) -> i64 {
        (self.sockets_alive - self.sockets_in_use).max(0)
    }

    /// Operations still waiting for a reply.
    #[must_use]
    pub fn ops_in_flight(&self) -> i64 {
        (self.sent_ops - self.received_ops).max(0)
    }
}

/// Read side of the driver counters.
pub trait StatsSource: Send + Sync {
    /// Read all counters.
    fn snapshot(&self) -> Stats;
}

/// Atomic recorder of driver events.
///
/// Each method corresponds to one driver event. Counters are independent
/// atomics, so a snapshot taken while events are being recorded can be off by
/// the events in flight; gauges tolerate that.
#[derive(Debug, Default)]
pub struct DriverStats {
    clusters: AtomicI64,
    master_conns: AtomicI64,
    slave_conns: AtomicI64,
    sent_ops: AtomicI64,
    received_ops: AtomicI64,
    received_docs: AtomicI64,
    sockets_alive: AtomicI64,
    sockets_in_use: AtomicI64,
    socket_refs: AtomicI64,
}

impl DriverStats {
    /// Create a recorder with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster (topology) was opened.
    pub fn cluster_opened(&self) {
        self.clusters.fetch_add(1, Ordering::Relaxed);
    }

    /// A cluster (topology) was closed.
    pub fn cluster_closed(&self) {
        self.clusters.fetch_sub(1, Ordering::Relaxed);
    }

    /// A socket was opened to a writable (`master = true`) or read-only server.
    pub fn socket_opened(&self, master: bool) {
        self.sockets_alive.fetch_add(1, Ordering::Relaxed);
        self.role_counter(master).fetch_add(1, Ordering::Relaxed);
    }

    /// A socket previously opened with the same role was closed.
    pub fn socket_closed(&self, master: bool) {
        self.sockets_alive.fetch_sub(1, Ordering::Relaxed);
        self.role_counter(master).fetch_sub(1, Ordering::Relaxed);
    }

    /// A caller started waiting for a socket.
    pub fn socket_requested(&self) {
        self.socket_refs.fetch_add(1, Ordering::Relaxed);
    }

    /// A pending socket request failed.
    pub fn socket_request_failed(&self) {
        self.socket_refs.fetch_sub(1, Ordering::Relaxed);
    }

    /// A socket was handed to a caller.
    pub fn socket_acquired(&self) {
        self.sockets_in_use.fetch_add(1, Ordering::Relaxed);
    }

    /// A socket was returned to the pool.
    pub fn socket_released(&self) {
        self.sockets_in_use.fetch_sub(1, Ordering::Relaxed);
        self.socket_refs.fetch_sub(1, Ordering::Relaxed);
    }

    /// An operation was sent to the server.
    pub fn op_sent(&self) {
        self.sent_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// A reply carrying `docs` documents was received.
    pub fn op_received(&self, docs: i64) {
        self.received_ops.fetch_add(1, Ordering::Relaxed);
        self.received_docs.fetch_add(docs, Ordering::Relaxed);
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn role_counter(&self, master: bool) -> &AtomicI64 {
        if master {
            &self.master_conns
        } else {
            &self.slave_conns
        }
    }

    fn counters(&self) -> [&AtomicI64; 9] {
        [
            &self.clusters,
            &self.master_conns,
            &self.slave_conns,
            &self.sent_ops,
            &self.received_ops,
            &self.received_docs,
            &self.sockets_alive,
            &self.sockets_in_use,
            &self.socket_refs,
        ]
    }
}

impl StatsSource for DriverStats {
    fn snapshot(&self) -> Stats {
        Stats {
            clusters: self.clusters.load(Ordering::Relaxed),
            master_conns: self.master_conns.load(Ordering::Relaxed),
            slave_conns: self.slave_conns.load(Ordering::Relaxed),
            sent_ops: self.sent_ops.load(Ordering::Relaxed),
            received_ops: self.received_ops.load(Ordering::Relaxed),
            received_docs: self.received_docs.load(Ordering::Relaxed),
            sockets_alive: self.sockets_alive.load(Ordering::Relaxed),
            sockets_in_use: self.sockets_in_use.load(Ordering::Relaxed),
            socket_refs: self.socket_refs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_lifecycle_counts() {
        let stats = DriverStats::new();
        stats.cluster_opened();
        stats.socket_opened(true);
        stats.socket_opened(false);
        stats.socket_opened(false);
        stats.socket_requested();
        stats.socket_acquired();

        let snap = stats.snapshot();
        assert_eq!(snap.clusters, 1);
        assert_eq!(snap.master_conns, 1);
        assert_eq!(snap.slave_conns, 2);
        assert_eq!(snap.sockets_alive, 3);
        assert_eq!(snap.sockets_in_use, 1);
        assert_eq!(snap.socket_refs, 1);
        assert_eq!(snap.sockets_idle(), 2);

        stats.socket_released();
        stats.socket_closed(false);
        let snap = stats.snapshot();
        assert_eq!(snap.slave_conns, 1);
        assert_eq!(snap.sockets_alive, 2);
        assert_eq!(snap.sockets_in_use, 0);
        assert_eq!(snap.socket_refs, 0);
    }

    #[test]
    fn test_failed_request_drops_reference() {
        let stats = DriverStats::new();
        stats.socket_requested();
        stats.socket_requested();
        stats.socket_request_failed();
        assert_eq!(stats.snapshot().socket_refs, 1);
    }

    #[test]
    fn test_ops_and_docs() {
        let stats = DriverStats::new();
        stats.op_sent();
        stats.op_sent();
        stats.op_received(101);

        let snap = stats.snapshot();
        assert_eq!(snap.sent_ops, 2);
        assert_eq!(snap.received_ops, 1);
        assert_eq!(snap.received_docs, 101);
        assert_eq!(snap.ops_in_flight(), 1);
    }

    #[test]
    fn test_values_order_and_reset() {
        let stats = DriverStats::new();
        stats.cluster_opened();
        stats.op_received(3);
        assert_eq!(stats.snapshot().values(), [1, 0, 0, 0, 1, 3, 0, 0, 0]);

        stats.reset();
        assert_eq!(stats.snapshot(), Stats::default());
    }
}
