// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the mediation core. Relaxed ordering
/// throughout; these feed logs, not control flow.
#[derive(Debug, Default)]
pub struct Stats {
    pub events_inserted: AtomicU64,
    pub events_enqueued: AtomicU64,
    pub enqueue_drops: AtomicU64,
    pub responses: AtomicU64,
    pub responses_unknown: AtomicU64,
    pub continuations: AtomicU64,
    pub timeouts: AtomicU64,
    pub interrupts: AtomicU64,
    pub stalls_aborted: AtomicU64,
    pub task_cache_hits: AtomicU64,
    pub inode_cache_hits: AtomicU64,
    pub events_delivered: AtomicU64,
    pub bytes_delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub events_inserted: u64,
    pub events_enqueued: u64,
    pub enqueue_drops: u64,
    pub responses: u64,
    pub responses_unknown: u64,
    pub continuations: u64,
    pub timeouts: u64,
    pub interrupts: u64,
    pub stalls_aborted: u64,
    pub task_cache_hits: u64,
    pub inode_cache_hits: u64,
    pub events_delivered: u64,
    pub bytes_delivered: u64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_inserted: self.events_inserted.load(Ordering::Relaxed),
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            enqueue_drops: self.enqueue_drops.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            responses_unknown: self.responses_unknown.load(Ordering::Relaxed),
            continuations: self.continuations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            stalls_aborted: self.stalls_aborted.load(Ordering::Relaxed),
            task_cache_hits: self.task_cache_hits.load(Ordering::Relaxed),
            inode_cache_hits: self.inode_cache_hits.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "inserted={} enqueued={} drops={} responses={} unknown={} continues={} timeouts={} interrupts={} aborted={} task_hits={} inode_hits={} delivered={} bytes={}",
            self.events_inserted,
            self.events_enqueued,
            self.enqueue_drops,
            self.responses,
            self.responses_unknown,
            self.continuations,
            self.timeouts,
            self.interrupts,
            self.stalls_aborted,
            self.task_cache_hits,
            self.inode_cache_hits,
            self.events_delivered,
            self.bytes_delivered,
        )
    }
}
