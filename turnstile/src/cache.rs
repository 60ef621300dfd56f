// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verdict caches. A hook that finds a fresh entry here answers without a
//! user-space round trip. Bounded capacity, clock-hand eviction, full flush
//! whenever stall mode flips so a stale verdict can never outlive a policy
//! change.

use std::{
    hash::{Hash, Hasher},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use crate::event::Verdict;

const CACHE_SHARDS: usize = 8;

/// Task-scoped key: the same task repeating the same class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub tgid: u32,
    pub kind: u16,
}

/// Object-scoped key: repeated decisions on the same inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: u32,
    pub ino: u64,
    pub kind: u16,
}

pub type TaskCache = VerdictCache<TaskKey>;
pub type InodeCache = VerdictCache<InodeKey>;

#[derive(Debug, Clone, Copy)]
pub struct CachedVerdict {
    pub verdict: Verdict,
    pub age: Duration,
    pub hits: u32,
}

struct Slot<K> {
    key: K,
    verdict: Verdict,
    inserted: Instant,
    hits: AtomicU32,
    referenced: AtomicBool,
}

struct CacheShard<K> {
    slots: Vec<Slot<K>>,
    hand: usize,
}

pub struct VerdictCache<K> {
    shards: Box<[RwLock<CacheShard<K>>]>,
    capacity_per_shard: usize,
    ttl: Duration,
}

impl<K: Copy + Eq + Hash> VerdictCache<K> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity_per_shard = (capacity / CACHE_SHARDS).max(1);
        let shards = (0..CACHE_SHARDS)
            .map(|_| {
                RwLock::new(CacheShard {
                    slots: Vec::with_capacity(capacity_per_shard),
                    hand: 0,
                })
            })
            .collect();

        Self {
            shards,
            capacity_per_shard,
            ttl,
        }
    }

    fn shard(&self, key: &K) -> &RwLock<CacheShard<K>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % CACHE_SHARDS]
    }

    /// Read path: shared lock only, per-slot bookkeeping via atomics.
    pub fn lookup(&self, key: &K) -> Option<CachedVerdict> {
        let shard = self.shard(key).read();

        let slot = shard.slots.iter().find(|s| s.key == *key)?;
        let age = slot.inserted.elapsed();
        if age > self.ttl {
            return None;
        }

        slot.referenced.store(true, Ordering::Relaxed);
        let hits = slot.hits.fetch_add(1, Ordering::Relaxed) + 1;

        Some(CachedVerdict {
            verdict: slot.verdict,
            age,
            hits,
        })
    }

    /// Records a user-space verdict.
    pub fn insert(&self, key: K, verdict: Verdict) {
        let mut shard = self.shard(&key).write();

        if let Some(slot) = shard.slots.iter_mut().find(|s| s.key == key) {
            slot.verdict = verdict;
            slot.inserted = Instant::now();
            slot.referenced.store(true, Ordering::Relaxed);
            return;
        }

        let slot = Slot {
            key,
            verdict,
            inserted: Instant::now(),
            hits: AtomicU32::new(0),
            referenced: AtomicBool::new(true),
        };

        if shard.slots.len() < self.capacity_per_shard {
            shard.slots.push(slot);
            return;
        }

        // Clock hand: skip recently referenced slots once around, then take
        // whatever the hand rests on.
        let capacity = self.capacity_per_shard;
        let mut victim = None;
        for _ in 0..=capacity {
            let hand = shard.hand;
            let referenced = shard.slots[hand].referenced.swap(false, Ordering::Relaxed);
            shard.hand = (hand + 1) % capacity;
            if !referenced {
                victim = Some(hand);
                break;
            }
        }

        let victim = victim.unwrap_or(shard.hand);
        shard.slots[victim] = slot;
    }

    pub fn flush(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            shard.slots.clear();
            shard.hand = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
