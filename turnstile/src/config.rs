// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime configuration. Readers take a `Copy` snapshot; mutation happens
//! only through [`Config::apply`] under the write lock, with out-of-range
//! values clamped rather than rejected.

use log::info;
use parking_lot::RwLock;
use turnstile_common::{
    hook, BYPASS_MODE_SET, DEFAULT_CONTINUE_TIMEOUT_MS, DEFAULT_STALL_TIMEOUT_MS, IGNORE_MODE_SET,
    MAX_EXTENDED_TIMEOUT_MS, MAX_WAIT_TIMEOUT_MS, MIN_WAIT_TIMEOUT_MS, STALL_CONTINUE_TIMEOUT,
    STALL_DEFAULT_DENY, STALL_DEFAULT_TIMEOUT, STALL_MODE_SET,
};

#[derive(Debug, Clone, Copy)]
pub struct ConfigSnapshot {
    pub stall_mode: bool,
    pub bypass_mode: bool,
    pub ignore_mode: bool,
    pub deny_on_timeout: bool,
    pub stall_timeout_ms: u32,
    pub continue_timeout_ms: u32,
    pub enabled_hooks: u64,
    /// Bit per event kind; a set bit forces the STALL flag off for that kind.
    pub stall_disable_mask: u32,
    pub mmap_stall_on_exec: bool,
    pub mmap_stall_on_ldso: bool,
    pub mmap_stall_misc: bool,
    pub mmap_report_misc: bool,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            stall_mode: false,
            bypass_mode: false,
            ignore_mode: false,
            deny_on_timeout: false,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            continue_timeout_ms: DEFAULT_CONTINUE_TIMEOUT_MS,
            enabled_hooks: hook::ALL_HOOKS,
            stall_disable_mask: 0,
            mmap_stall_on_exec: true,
            mmap_stall_on_ldso: false,
            mmap_stall_misc: false,
            mmap_report_misc: true,
        }
    }
}

/// A control request: `flags` selects which fields apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlRequest {
    pub flags: u32,
    pub stall_mode: u32,
    pub stall_timeout_ms: u32,
    pub continue_timeout_ms: u32,
    pub deny_on_timeout: u32,
    pub bypass_mode: u32,
    pub ignore_mode: u32,
}

/// What a control request changed, so the caller can run the transition
/// side effects (cache flush, waking stalled tasks) outside the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppliedChange {
    pub stall_mode_changed: bool,
    pub stall_mode_now: bool,
}

pub struct Config {
    inner: RwLock<ConfigSnapshot>,
}

impl Config {
    pub fn new(initial: ConfigSnapshot) -> Self {
        let mut initial = initial;
        initial.stall_timeout_ms = clamp_wait(initial.stall_timeout_ms);
        initial.continue_timeout_ms = clamp_continue(initial.continue_timeout_ms, initial.stall_timeout_ms);

        Self {
            inner: RwLock::new(initial),
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        *self.inner.read()
    }

    pub fn apply(&self, req: &ControlRequest) -> AppliedChange {
        let mut change = AppliedChange::default();
        let mut cfg = self.inner.write();

        if req.flags & STALL_MODE_SET != 0 {
            let want = req.stall_mode != 0;
            if cfg.stall_mode != want {
                cfg.stall_mode = want;
                change.stall_mode_changed = true;
                info!("stall mode {}", if want { "enabled" } else { "disabled" });
            }
        }

        if req.flags & STALL_DEFAULT_TIMEOUT != 0 {
            cfg.stall_timeout_ms = clamp_wait(req.stall_timeout_ms);
        }

        if req.flags & STALL_CONTINUE_TIMEOUT != 0 {
            cfg.continue_timeout_ms = clamp_continue(req.continue_timeout_ms, cfg.stall_timeout_ms);
        }

        if req.flags & STALL_DEFAULT_DENY != 0 {
            cfg.deny_on_timeout = req.deny_on_timeout != 0;
        }

        if req.flags & BYPASS_MODE_SET != 0 {
            cfg.bypass_mode = req.bypass_mode != 0;
        }

        if req.flags & IGNORE_MODE_SET != 0 {
            cfg.ignore_mode = req.ignore_mode != 0;
        }

        change.stall_mode_now = cfg.stall_mode;
        change
    }

    pub fn set_stall_mode(&self, enabled: bool) -> AppliedChange {
        self.apply(&ControlRequest {
            flags: STALL_MODE_SET,
            stall_mode: enabled as u32,
            ..Default::default()
        })
    }

    pub fn set_enabled_hooks(&self, mask: u64) {
        self.inner.write().enabled_hooks = mask;
    }

    pub fn set_stall_disable_mask(&self, mask: u32) {
        self.inner.write().stall_disable_mask = mask;
    }
}

fn clamp_wait(ms: u32) -> u32 {
    ms.clamp(MIN_WAIT_TIMEOUT_MS, MAX_WAIT_TIMEOUT_MS)
}

/// The continuation timeout is at least the regular timeout, at most the
/// extended bound.
fn clamp_continue(ms: u32, stall_timeout_ms: u32) -> u32 {
    ms.clamp(stall_timeout_ms, MAX_EXTENDED_TIMEOUT_MS)
}

impl ConfigSnapshot {
    pub fn hook_enabled(&self, hook_id: u16) -> bool {
        self.enabled_hooks & hook::hook_mask(hook_id) != 0
    }

    pub fn stall_disabled_for(&self, event_type: u16) -> bool {
        event_type < 32 && self.stall_disable_mask & (1 << event_type) != 0
    }
}
