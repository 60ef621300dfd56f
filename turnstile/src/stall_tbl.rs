// SPDX-License-Identifier: MIT OR Apache-2.0

//! The stall table: a sharded map of in-flight rendezvous entries plus the
//! per-shard delivery queues for audit events.
//!
//! Entries are keyed and sharded by request id. Queued events shard by the
//! originating thread id instead, and every task gets a single queue that
//! drains in submission order; priority decides which task a shard serves
//! first, never the order within one task's stream.

use std::{
    collections::{hash_map::Entry, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use log::warn;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{
    event::{Event, EventKind, Response},
    stats::Stats,
    wire,
};

pub const SHARD_COUNT: usize = 32;
const SHARD_MASK: u64 = (SHARD_COUNT as u64) - 1;

/// Entries allowed per shard before insert reports NoResources.
const MAX_ENTRIES_PER_SHARD: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("out of table space")]
    NoResources,
    #[error("stall table disabled")]
    Disabled,
    #[error("duplicate request id")]
    Duplicate,
    #[error("delivery queue full")]
    QueueFull,
    #[error("no entry for request id")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stall,
    Released,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Low,
}

/// Everything the response path needs to update the verdict caches, copied
/// out of the event before it is serialized away.
#[derive(Debug, Clone, Copy)]
pub struct CacheHint {
    pub tgid: u32,
    pub kind: EventKind,
    pub inode: Option<(u32, u64)>,
}

#[derive(Debug)]
pub struct EntryState {
    pub mode: Mode,
    pub response: Response,
    /// Agent-requested timeout for the next round; 0 means use config.
    pub continuation_timeout_ms: u32,
    pub interrupted: bool,
}

/// Rendezvous object for one stalling event. Shared between the blocked
/// originator and the response path; drops when the last holder does.
#[derive(Debug)]
pub struct StallEntry {
    pub request_id: u64,
    pub tid: u32,
    pub cache_hint: CacheHint,
    state: Mutex<EntryState>,
    cond: Condvar,
}

impl StallEntry {
    fn new(request_id: u64, tid: u32, cache_hint: CacheHint, default_response: Response) -> Self {
        Self {
            request_id,
            tid,
            cache_hint,
            state: Mutex::new(EntryState {
                mode: Mode::Stall,
                response: default_response,
                continuation_timeout_ms: 0,
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Response path: publish the agent's answer and wake the waiter.
    pub fn release(&self, response: Response, continuation_timeout_ms: u32) {
        let mut state = self.state.lock();
        state.response = response;
        state.continuation_timeout_ms = continuation_timeout_ms;
        state.mode = Mode::Released;
        self.cond.notify_one();
    }

    /// Abort path used on global disable; the waiter returns ALLOW with the
    /// disabled indicator.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.mode = Mode::Aborted;
        self.cond.notify_one();
    }

    /// Treated exactly like a timeout by the waiter. Exposed so the
    /// embedding layer can forward task-signal cancellation.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_one();
    }

    /// One round of waiting. Blocks until released, aborted, interrupted or
    /// the timeout elapses, then hands the caller a copy of the state. A
    /// released entry is re-armed to Stall before returning, so the agent
    /// can continue it another round.
    pub fn wait_round(&self, timeout: Duration) -> WaitOutcome {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();

        while state.mode == Mode::Stall && !state.interrupted {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        if state.mode == Mode::Aborted {
            return WaitOutcome::Aborted;
        }
        if state.interrupted {
            return WaitOutcome::Interrupted;
        }
        if state.mode == Mode::Stall {
            return WaitOutcome::TimedOut;
        }

        let response = state.response;
        let continuation_timeout_ms = state.continuation_timeout_ms;
        state.mode = Mode::Stall;
        state.continuation_timeout_ms = 0;

        WaitOutcome::Released {
            response,
            continuation_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Released {
        response: Response,
        continuation_timeout_ms: u32,
    },
    TimedOut,
    Interrupted,
    Aborted,
}

struct QueuedEvent {
    bytes: Bytes,
    /// Audit events count against the high-water mark; stalled events are
    /// published unconditionally.
    audit: bool,
    priority: Priority,
}

/// One task's pending events, strictly in submission order.
#[derive(Default)]
struct TaskQueue {
    events: VecDeque<QueuedEvent>,
    normal_pending: usize,
}

#[derive(Default)]
struct ShardInner {
    entries: HashMap<u64, Arc<StallEntry>>,
    queues: HashMap<u32, TaskQueue>,
    /// Tids with pending events, in arrival order.
    active: VecDeque<u32>,
    audit_bytes: usize,
}

impl ShardInner {
    fn push_event(&mut self, tid: u32, queued: QueuedEvent) {
        let queue = match self.queues.entry(tid) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.active.push_back(tid);
                entry.insert(TaskQueue::default())
            }
        };

        if queued.priority == Priority::Normal {
            queue.normal_pending += 1;
        }
        queue.events.push_back(queued);
    }
}

#[derive(Default)]
struct Shard {
    inner: Mutex<ShardInner>,
}

pub struct StallTable {
    shards: Box<[Shard]>,
    enabled: AtomicBool,
    next_request_id: AtomicU64,
    /// Bytes of queued audit events allowed per shard.
    queue_high_water: usize,
    pending_events: AtomicUsize,
    delivery_lock: Mutex<()>,
    delivery_cond: Condvar,
    stats: Arc<Stats>,
}

impl StallTable {
    pub fn new(queue_high_water: usize, stats: Arc<Stats>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Shard::default()).collect();

        Self {
            shards,
            enabled: AtomicBool::new(false),
            next_request_id: AtomicU64::new(1),
            queue_high_water,
            pending_events: AtomicUsize::new(0),
            delivery_lock: Mutex::new(()),
            delivery_cond: Condvar::new(),
            stats,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.abort_all();
        }
        // Wake the delivery loop so it can observe shutdown.
        self.delivery_cond.notify_all();
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn entry_shard(&self, request_id: u64) -> &Shard {
        &self.shards[(request_id & SHARD_MASK) as usize]
    }

    fn queue_shard(&self, tid: u32) -> &Shard {
        &self.shards[(tid as u64 & SHARD_MASK) as usize]
    }

    /// Publishes a stalling event: assigns its request id, serializes it
    /// into the delivery stream (lossless) and creates the rendezvous
    /// entry. The event is consumed either way.
    pub fn insert(
        &self,
        mut event: Event,
        default_response: Response,
    ) -> Result<Arc<StallEntry>, TableError> {
        if !self.enabled() {
            return Err(TableError::Disabled);
        }

        if event.request_id == 0 {
            event.request_id = self.next_request_id();
        }
        let request_id = event.request_id;
        let tid = event.tid();

        let hint = CacheHint {
            tgid: event.task.pid,
            kind: event.kind,
            inode: event.file_identity(),
        };
        let entry = Arc::new(StallEntry::new(request_id, tid, hint, default_response));

        {
            let mut shard = self.entry_shard(request_id).inner.lock();
            if shard.entries.len() >= MAX_ENTRIES_PER_SHARD {
                return Err(TableError::NoResources);
            }
            if shard.entries.contains_key(&request_id) {
                // Monotonic assignment makes this unreachable; treat as a bug.
                warn!("duplicate request id {request_id} in stall table");
                return Err(TableError::Duplicate);
            }
            shard.entries.insert(request_id, entry.clone());
        }

        let bytes = Bytes::from(wire::encode(&event));
        self.queue_shard(tid).inner.lock().push_event(
            tid,
            QueuedEvent {
                bytes,
                audit: false,
                priority: Priority::Normal,
            },
        );

        Stats::bump(&self.stats.events_inserted);
        self.signal_delivery();

        Ok(entry)
    }

    /// Unlinks the entry from the table. Idempotent; called by the waiter on
    /// every exit path.
    pub fn remove(&self, entry: &StallEntry) {
        let mut shard = self.entry_shard(entry.request_id).inner.lock();
        shard.entries.remove(&entry.request_id);
    }

    /// Matches an agent response to its waiter. Returns the entry's cache
    /// hint so the caller can record the verdict.
    pub fn resolve(
        &self,
        request_id: u64,
        response: Response,
        continuation_timeout_ms: u32,
    ) -> Result<CacheHint, TableError> {
        let entry = {
            let shard = self.entry_shard(request_id).inner.lock();
            shard.entries.get(&request_id).cloned()
        };

        let Some(entry) = entry else {
            return Err(TableError::NotFound);
        };

        entry.release(response, continuation_timeout_ms);
        Ok(entry.cache_hint)
    }

    /// Forwards a task-signal cancellation to the waiter; treated exactly
    /// like a timeout. No-op for unknown ids.
    pub fn interrupt(&self, request_id: u64) {
        let entry = {
            let shard = self.entry_shard(request_id).inner.lock();
            shard.entries.get(&request_id).cloned()
        };

        if let Some(entry) = entry {
            entry.interrupt();
        }
    }

    /// Appends a non-stalling event to its task's FIFO. Returns the bytes
    /// accepted, or 0 when the shard is over its high-water mark (the event
    /// is dropped and counted).
    pub fn enqueue_nonstall(&self, mut event: Event, priority: Priority) -> usize {
        if !self.enabled() {
            return 0;
        }

        if event.request_id == 0 {
            event.request_id = self.next_request_id();
        }
        let tid = event.tid();
        let bytes = Bytes::from(wire::encode(&event));
        let len = bytes.len();

        {
            let mut shard = self.queue_shard(tid).inner.lock();
            if shard.audit_bytes + len > self.queue_high_water {
                Stats::bump(&self.stats.enqueue_drops);
                return 0;
            }
            shard.audit_bytes += len;
            shard.push_event(
                tid,
                QueuedEvent {
                    bytes,
                    audit: true,
                    priority,
                },
            );
        }

        Stats::bump(&self.stats.events_enqueued);
        self.signal_delivery();

        len
    }

    /// Drains up to `max_bytes` of serialized events. Within a shard, tasks
    /// with normal-priority events pending are served before tasks holding
    /// only low-priority events, but each task's own queue drains strictly
    /// in submission order (an earlier low-priority event rides out ahead
    /// of the normal one queued behind it). Across shards the starting
    /// point rotates per call so no shard is starved.
    pub fn dequeue_batch(&self, cursor: &mut usize, max_bytes: usize) -> Vec<Bytes> {
        let mut batch = Vec::new();
        let mut total = 0usize;
        let start = *cursor;

        'shards: for i in 0..SHARD_COUNT {
            let mut guard = self.shards[(start + i) % SHARD_COUNT].inner.lock();
            let shard = &mut *guard;

            for low_pass in [false, true] {
                let mut idx = 0;
                while idx < shard.active.len() {
                    let tid = shard.active[idx];
                    let Some(queue) = shard.queues.get_mut(&tid) else {
                        shard.active.remove(idx);
                        continue;
                    };

                    loop {
                        // The normal pass stops at the tail of low-priority
                        // events behind a task's last normal one; those can
                        // wait without reordering the stream.
                        if !low_pass && queue.normal_pending == 0 {
                            break;
                        }

                        let Some(next_len) = queue.events.front().map(|q| q.bytes.len()) else {
                            break;
                        };
                        if !batch.is_empty() && total + next_len > max_bytes {
                            break 'shards;
                        }

                        let Some(queued) = queue.events.pop_front() else {
                            break;
                        };
                        if queued.priority == Priority::Normal {
                            queue.normal_pending -= 1;
                        }
                        if queued.audit {
                            shard.audit_bytes -= queued.bytes.len();
                        }
                        total += queued.bytes.len();
                        self.pending_events.fetch_sub(1, Ordering::Relaxed);
                        batch.push(queued.bytes);
                    }

                    if queue.events.is_empty() {
                        shard.queues.remove(&tid);
                        shard.active.remove(idx);
                    } else {
                        idx += 1;
                    }
                }
            }
        }

        *cursor = (start + 1) % SHARD_COUNT;

        Stats::add(&self.stats.events_delivered, batch.len() as u64);
        Stats::add(&self.stats.bytes_delivered, total as u64);

        batch
    }

    /// Blocks the delivery loop until at least one event is queued, the
    /// table is disabled, or the timeout passes. Returns whether events are
    /// pending.
    pub fn wait_for_events(&self, timeout: Duration) -> bool {
        if self.pending_events.load(Ordering::Acquire) > 0 {
            return true;
        }

        let mut guard = self.delivery_lock.lock();
        if self.pending_events.load(Ordering::Acquire) == 0 && self.enabled() {
            self.delivery_cond.wait_for(&mut guard, timeout);
        }

        self.pending_events.load(Ordering::Acquire) > 0
    }

    fn signal_delivery(&self) {
        self.pending_events.fetch_add(1, Ordering::Release);
        let _guard = self.delivery_lock.lock();
        self.delivery_cond.notify_one();
    }

    /// Wakes every in-flight stall with the aborted indicator. Waiters
    /// return ALLOW and clean up their own entries.
    pub fn abort_all(&self) {
        for shard in self.shards.iter() {
            let entries: Vec<_> = shard.inner.lock().entries.values().cloned().collect();
            for entry in entries {
                entry.abort();
                Stats::bump(&self.stats.stalls_aborted);
            }
        }
    }

    /// Discards all queued events. Used when the agent goes away; stalled
    /// entries are not touched here, abort_all handles those.
    pub fn flush_queues(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.inner.lock();
            let dropped: usize = shard.queues.values().map(|q| q.events.len()).sum();
            shard.queues.clear();
            shard.active.clear();
            shard.audit_bytes = 0;
            self.pending_events.fetch_sub(dropped, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.inner.lock().entries.len())
            .sum()
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }
}
