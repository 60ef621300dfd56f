// SPDX-License-Identifier: MIT OR Apache-2.0

use parking_lot::RwLock;

/// Thread-group ids belonging to the decision agent. Events originating
/// from these never stall and skip the caches, which keeps the agent from
/// deadlocking on its own file activity.
#[derive(Debug, Default)]
pub struct SelfSet {
    tgids: RwLock<Vec<u32>>,
}

impl SelfSet {
    pub fn insert(&self, tgid: u32) {
        let mut tgids = self.tgids.write();
        if !tgids.contains(&tgid) {
            tgids.push(tgid);
        }
    }

    pub fn remove(&self, tgid: u32) {
        self.tgids.write().retain(|t| *t != tgid);
    }

    pub fn contains(&self, tgid: u32) -> bool {
        self.tgids.read().contains(&tgid)
    }

    pub fn clear(&self) {
        self.tgids.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tgids.read().is_empty()
    }
}
