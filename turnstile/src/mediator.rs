// SPDX-License-Identifier: MIT OR Apache-2.0

//! The process-level handle owning every shared piece of the mediation
//! core. OS entry points and the delivery surface both go through this; no
//! global singletons.

use std::{sync::Arc, time::Duration};

use log::{debug, info};

use crate::{
    cache::{InodeCache, InodeKey, TaskCache, TaskKey},
    config::{Config, ConfigSnapshot, ControlRequest},
    event::{EventKind, Response, Verdict},
    self_set::SelfSet,
    stall_tbl::{CacheHint, StallTable, TableError},
    stats::Stats,
};

const TASK_CACHE_CAPACITY: usize = 512;
const INODE_CACHE_CAPACITY: usize = 2048;
const TASK_CACHE_TTL: Duration = Duration::from_secs(2);
const INODE_CACHE_TTL: Duration = Duration::from_secs(5);

/// Tunables fixed at construction; everything else lives in [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct MediatorOptions {
    /// Bytes of queued audit events allowed per stall-table shard.
    pub queue_high_water: usize,
    pub initial: ConfigSnapshot,
}

impl Default for MediatorOptions {
    fn default() -> Self {
        Self {
            queue_high_water: 1 << 20,
            initial: ConfigSnapshot::default(),
        }
    }
}

pub struct Mediator {
    pub(crate) config: Config,
    pub(crate) table: StallTable,
    pub(crate) task_cache: TaskCache,
    pub(crate) inode_cache: InodeCache,
    pub(crate) self_set: SelfSet,
    pub(crate) stats: Arc<Stats>,
}

impl Mediator {
    pub fn new(options: MediatorOptions) -> Self {
        let stats = Arc::new(Stats::default());

        Self {
            config: Config::new(options.initial),
            table: StallTable::new(options.queue_high_water, stats.clone()),
            task_cache: TaskCache::new(TASK_CACHE_CAPACITY, TASK_CACHE_TTL),
            inode_cache: InodeCache::new(INODE_CACHE_CAPACITY, INODE_CACHE_TTL),
            self_set: SelfSet::default(),
            stats,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &StallTable {
        &self.table
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn self_set(&self) -> &SelfSet {
        &self.self_set
    }

    /// Routes an agent response to its waiter. An unknown request id is
    /// accepted silently; the waiter may have timed out already.
    pub fn apply_response(
        &self,
        request_id: u64,
        response: Response,
        continuation_timeout_ms: u32,
    ) {
        match self.table.resolve(request_id, response, continuation_timeout_ms) {
            Ok(hint) => {
                Stats::bump(&self.stats.responses);
                if response != Response::Continue {
                    self.record_verdict(&hint, response.verdict());
                }
            }
            Err(TableError::NotFound) => {
                Stats::bump(&self.stats.responses_unknown);
                debug!("response for unknown request {request_id}");
            }
            Err(_) => unreachable!("resolve only reports NotFound"),
        }
    }

    /// Applies a control request, flushing both caches whenever stall mode
    /// transitions so no stale verdict survives a policy change. Turning
    /// stall mode off also aborts every in-flight stall.
    pub fn configure(&self, req: &ControlRequest) {
        let change = self.config.apply(req);

        if change.stall_mode_changed {
            self.flush_caches();
            if !change.stall_mode_now {
                self.table.abort_all();
            }
        }
    }

    pub fn flush_caches(&self) {
        self.task_cache.flush();
        self.inode_cache.flush();
    }

    /// Registers the decision agent. Events from its thread group carry
    /// SELF from here on and the event stream starts accumulating.
    pub fn agent_attach(&self, tgid: u32) {
        info!("agent attached (tgid {tgid})");
        self.self_set.insert(tgid);
        self.flush_caches();
        self.table.set_enabled(true);
    }

    /// Tears the agent down: mediation is fail-open without a consumer, so
    /// stalling stops, in-flight waits are released and everything cached
    /// or queued is discarded.
    pub fn agent_detach(&self, tgid: u32) {
        self.self_set.remove(tgid);

        if self.self_set.is_empty() {
            self.config.set_stall_mode(false);
            self.table.set_enabled(false);
            self.table.flush_queues();
            self.flush_caches();
            info!(
                "agent detached (tgid {tgid}); stats: {}",
                self.stats.snapshot().summary()
            );
        }
    }

    fn record_verdict(&self, hint: &CacheHint, verdict: Verdict) {
        if kind_uses_task_cache(hint.kind) {
            self.task_cache.insert(
                TaskKey {
                    tgid: hint.tgid,
                    kind: hint.kind.as_u16(),
                },
                verdict,
            );
        }

        if kind_uses_inode_cache(hint.kind) {
            if let Some((dev, ino)) = hint.inode {
                self.inode_cache.insert(
                    InodeKey {
                        dev,
                        ino,
                        kind: hint.kind.as_u16(),
                    },
                    verdict,
                );
            }
        }
    }
}

/// Kinds where the same task repeating the same operation class may reuse
/// the previous verdict.
pub(crate) fn kind_uses_task_cache(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::Unlink
            | EventKind::Rmdir
            | EventKind::Rename
            | EventKind::Setattr
            | EventKind::Mkdir
            | EventKind::Create
            | EventKind::Link
            | EventKind::Symlink
            | EventKind::Setuid
            | EventKind::Setgid
    )
}

/// Kinds where repeated decisions on the same object may reuse the
/// previous verdict.
pub(crate) fn kind_uses_inode_cache(kind: EventKind) -> bool {
    matches!(kind, EventKind::Exec | EventKind::Open | EventKind::Mmap)
}
