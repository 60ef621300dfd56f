// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook adapters: the entry points the OS shim calls. Every adapter follows
//! the same skeleton: bail if the hook is disabled or no agent is listening,
//! drop uninteresting operations before allocating, work out the report
//! flags, consult the caches, build the event and either stall on it or
//! enqueue it.
//!
//! Adapters that can run in atomic context (close, signal, mmap, clone,
//! exit, task free) never stall; their whole path is lock-push-return.

use log::trace;
use turnstile_common::{hook, REPORT_AUDIT, REPORT_LO_PRI, REPORT_SELF, REPORT_STALL};

use crate::{
    cache::{InodeKey, TaskKey},
    config::ConfigSnapshot,
    event::{
        AttrChange, CredIds, DirInfo, Event, EventKind, FileInfo, ReportFlags, TaskInfo, Verdict,
    },
    factory,
    mediator::{kind_uses_inode_cache, kind_uses_task_cache, Mediator},
    stall_tbl::Priority,
    stats::Stats,
    wait,
};

// struct file state bits, kernel values.
const FMODE_WRITE: u32 = 0x2;
const FMODE_NONOTIFY: u32 = 0x4000000;

const PTRACE_MODE_ATTACH: u32 = 0x02;

/// Where a clone notification came from. Probe-sourced ones exist to catch
/// forks the regular hook missed and are audit-only, low priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOrigin {
    Hook,
    Probe,
}

impl Mediator {
    fn hook_active(&self, hook_id: u16, cfg: &ConfigSnapshot) -> bool {
        cfg.hook_enabled(hook_id) && self.table.enabled()
    }

    /// AUDIT always; STALL unless the originator is the agent itself or the
    /// kind has stalling switched off.
    fn report_flags(&self, task: &TaskInfo, kind: EventKind, cfg: &ConfigSnapshot) -> ReportFlags {
        let mut flags = ReportFlags(REPORT_AUDIT);

        if self.self_set.contains(task.pid) {
            flags.insert(REPORT_SELF);
        } else if !cfg.stall_disabled_for(kind.as_u16()) {
            flags.insert(REPORT_STALL);
        }

        flags
    }

    fn audit_flags(&self, task: &TaskInfo) -> ReportFlags {
        let mut flags = ReportFlags(REPORT_AUDIT);
        if self.self_set.contains(task.pid) {
            flags.insert(REPORT_SELF);
        }
        flags
    }

    fn cached_verdict(&self, task: &TaskInfo, kind: EventKind, file: Option<&FileInfo>) -> Option<Verdict> {
        if kind_uses_task_cache(kind) {
            let key = TaskKey {
                tgid: task.pid,
                kind: kind.as_u16(),
            };
            if let Some(hit) = self.task_cache.lookup(&key) {
                Stats::bump(&self.stats.task_cache_hits);
                trace!("{} task cache hit for tgid {}", kind.name(), task.pid);
                return Some(hit.verdict);
            }
        }

        if kind_uses_inode_cache(kind) {
            if let Some(file) = file {
                let key = InodeKey {
                    dev: file.dev,
                    ino: file.ino,
                    kind: kind.as_u16(),
                };
                if let Some(hit) = self.inode_cache.lookup(&key) {
                    Stats::bump(&self.stats.inode_cache_hits);
                    return Some(hit.verdict);
                }
            }
        }

        None
    }

    /// Stall or enqueue, folding every failure into fail-open ALLOW: the
    /// originating task must make forward progress.
    fn deliver(&self, event: Event, priority: Priority) -> Verdict {
        if event.report_flags.stall() {
            match wait::wait_for_verdict(&self.table, &self.config, &self.stats, event) {
                Ok(verdict) => verdict,
                Err(_) => Verdict::Allow,
            }
        } else {
            self.table.enqueue_nonstall(event, priority);
            Verdict::Allow
        }
    }

    fn enqueue_audit(&self, event: Event, priority: Priority) {
        self.table.enqueue_nonstall(event, priority);
    }
}

// The stall-capable adapters.
impl Mediator {
    pub fn exec(&self, task: TaskInfo, file: &FileInfo) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_EXEC, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Exec, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Exec, Some(file)) {
                return verdict;
            }
        }

        self.deliver(factory::exec(task, file.clone(), flags), Priority::Normal)
    }

    pub fn unlink(&self, task: TaskInfo, dir: DirInfo, file: &FileInfo) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_UNLINK, &cfg) {
            return Verdict::Allow;
        }
        if !(file.is_regular() || file.is_dir() || file.is_symlink()) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Unlink, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Unlink, None) {
                return verdict;
            }
        }

        self.deliver(factory::unlink(task, dir, file.clone(), flags), Priority::Normal)
    }

    pub fn rmdir(&self, task: TaskInfo, dir: DirInfo, file: &FileInfo) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_RMDIR, &cfg) {
            return Verdict::Allow;
        }
        if !(file.is_regular() || file.is_dir() || file.is_symlink()) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Rmdir, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Rmdir, None) {
                return verdict;
            }
        }

        self.deliver(factory::rmdir(task, dir, file.clone(), flags), Priority::Normal)
    }

    pub fn rename(
        &self,
        task: TaskInfo,
        old_dir: DirInfo,
        old_file: &FileInfo,
        new_dir: DirInfo,
        new_file: &FileInfo,
    ) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_RENAME, &cfg) {
            return Verdict::Allow;
        }
        if !(old_file.is_regular() || old_file.is_dir() || old_file.is_symlink()) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Rename, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Rename, None) {
                return verdict;
            }
        }

        self.deliver(
            factory::rename(task, old_dir, old_file.clone(), new_dir, new_file.clone(), flags),
            Priority::Normal,
        )
    }

    pub fn setattr(&self, task: TaskInfo, file: &FileInfo, attr: AttrChange) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_SETATTR, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Setattr, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Setattr, None) {
                return verdict;
            }
        }

        // The factory may find that nothing actually changes.
        let Some(event) = factory::setattr(task, file.clone(), attr, flags) else {
            return Verdict::Allow;
        };

        self.deliver(event, Priority::Normal)
    }

    pub fn mkdir(&self, task: TaskInfo, dir: DirInfo, mode: u16, file: &FileInfo) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_MKDIR, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Mkdir, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Mkdir, None) {
                return verdict;
            }
        }

        self.deliver(factory::mkdir(task, dir, mode, file.clone(), flags), Priority::Normal)
    }

    pub fn create(&self, task: TaskInfo, dir: DirInfo, mode: u16, file: &FileInfo) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_CREATE, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Create, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Create, None) {
                return verdict;
            }
        }

        self.deliver(factory::create(task, dir, mode, file.clone(), flags), Priority::Normal)
    }

    pub fn link(
        &self,
        task: TaskInfo,
        old_file: &FileInfo,
        new_dir: DirInfo,
        new_file: &FileInfo,
    ) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_LINK, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Link, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Link, None) {
                return verdict;
            }
        }

        self.deliver(
            factory::link(task, old_file.clone(), new_dir, new_file.clone(), flags),
            Priority::Normal,
        )
    }

    pub fn symlink(&self, task: TaskInfo, file: &FileInfo, target: &[u8]) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_SYMLINK, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Symlink, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Symlink, None) {
                return verdict;
            }
        }

        self.deliver(
            factory::symlink(task, file.clone(), target.to_vec(), flags),
            Priority::Normal,
        )
    }

    pub fn open(&self, task: TaskInfo, file: &FileInfo, f_flags: u32, f_mode: u32) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_OPEN, &cfg) {
            return Verdict::Allow;
        }
        if !file.is_regular() {
            return Verdict::Allow;
        }
        // Opens that asked not to be notified are only interesting when the
        // file could be mutated through them.
        if f_mode & FMODE_NONOTIFY != 0 && f_mode & FMODE_WRITE == 0 {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Open, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Open, Some(file)) {
                return verdict;
            }
        }

        self.deliver(
            factory::open(task, file.clone(), f_flags, f_mode, flags),
            Priority::Normal,
        )
    }

    /// `atomic_ctx` tells the adapter the caller cannot sleep; the mapping
    /// is then audited instead of stalled no matter what policy says.
    pub fn mmap(
        &self,
        task: TaskInfo,
        file: Option<&FileInfo>,
        prot: u64,
        map_flags: u64,
        atomic_ctx: bool,
    ) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_MMAP, &cfg) {
            return Verdict::Allow;
        }
        if prot & libc::PROT_EXEC as u64 == 0 {
            return Verdict::Allow;
        }

        let executable = map_flags & libc::MAP_EXECUTABLE as u64 != 0;
        let loader_map = file.is_some() && !executable;

        let stall_policy = if executable {
            cfg.mmap_stall_on_exec
        } else if loader_map {
            cfg.mmap_stall_on_ldso
        } else {
            cfg.mmap_stall_misc
        };

        let misc = !executable && !loader_map;
        if misc && !cfg.mmap_stall_misc && !cfg.mmap_report_misc {
            return Verdict::Allow;
        }

        let mut flags = self.report_flags(&task, EventKind::Mmap, &cfg);
        if !stall_policy || atomic_ctx {
            flags.remove(REPORT_STALL);
        }
        let priority = if misc {
            flags.insert(REPORT_LO_PRI);
            Priority::Low
        } else {
            Priority::Normal
        };

        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Mmap, file) {
                return verdict;
            }
        }

        self.deliver(
            factory::mmap(task, file.cloned(), prot, map_flags, flags),
            priority,
        )
    }

    pub fn setuid(&self, task: TaskInfo, old: CredIds, new: CredIds) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_SETUID, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Setuid, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Setuid, None) {
                return verdict;
            }
        }

        let Some(event) = factory::setuid(task, old, new, flags) else {
            return Verdict::Allow;
        };

        self.deliver(event, Priority::Normal)
    }

    pub fn setgid(&self, task: TaskInfo, old: CredIds, new: CredIds) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_SETGID, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.report_flags(&task, EventKind::Setgid, &cfg);
        if flags.stall() {
            if let Some(verdict) = self.cached_verdict(&task, EventKind::Setgid, None) {
                return verdict;
            }
        }

        let Some(event) = factory::setgid(task, old, new, flags) else {
            return Verdict::Allow;
        };

        self.deliver(event, Priority::Normal)
    }
}

// The audit-only adapters. These may run in atomic context and never block.
impl Mediator {
    pub fn close(&self, task: TaskInfo, file: &FileInfo, f_flags: u32, f_mode: u32) {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_CLOSE, &cfg) {
            return;
        }
        if !file.is_regular() {
            return;
        }
        // Same filter as open: a no-notify open that could not mutate the
        // file is not worth a close report either.
        if f_mode & FMODE_NONOTIFY != 0 && f_mode & FMODE_WRITE == 0 {
            return;
        }

        let flags = self.audit_flags(&task);
        self.enqueue_audit(
            factory::close(task, file.clone(), f_flags, f_mode, flags),
            Priority::Normal,
        );
    }

    pub fn ptrace_access_check(&self, source: TaskInfo, target: TaskInfo, mode: u32) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_PTRACE_ACCESS, &cfg) {
            return Verdict::Allow;
        }
        if mode & PTRACE_MODE_ATTACH == 0 {
            return Verdict::Allow;
        }
        // Loop guard: the agent inspecting itself is not worth reporting.
        if self.self_set.contains(source.pid) && self.self_set.contains(target.pid) {
            return Verdict::Allow;
        }

        let flags = self.audit_flags(&source);
        self.enqueue_audit(
            factory::ptrace(source, target, hook::HOOK_PTRACE_ACCESS, flags),
            Priority::Normal,
        );

        Verdict::Allow
    }

    pub fn ptrace_traceme(&self, parent: TaskInfo, child: TaskInfo) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_PTRACE_TRACEME, &cfg) {
            return Verdict::Allow;
        }

        let flags = self.audit_flags(&child);
        self.enqueue_audit(
            factory::ptrace(child, parent, hook::HOOK_PTRACE_TRACEME, flags),
            Priority::Normal,
        );

        Verdict::Allow
    }

    pub fn signal(&self, source: TaskInfo, target: TaskInfo, sig: u32) -> Verdict {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_SIGNAL, &cfg) {
            return Verdict::Allow;
        }
        // Signal 0 is an existence probe, not a delivery.
        if sig == 0 {
            return Verdict::Allow;
        }

        let flags = self.audit_flags(&source);
        self.enqueue_audit(factory::signal(source, target, sig, flags), Priority::Normal);

        Verdict::Allow
    }

    pub fn clone_task(&self, parent: TaskInfo, child: TaskInfo, origin: CloneOrigin) {
        let hook_id = match origin {
            CloneOrigin::Hook => hook::HOOK_CLONE,
            CloneOrigin::Probe => hook::HOOK_CLONE_PROBE,
        };
        let cfg = self.config.snapshot();
        if !self.hook_active(hook_id, &cfg) {
            return;
        }
        // Only process-level creation is reported.
        if child.is_thread() {
            return;
        }

        let mut flags = self.audit_flags(&parent);
        let priority = match origin {
            CloneOrigin::Hook => Priority::Normal,
            CloneOrigin::Probe => {
                flags.insert(REPORT_LO_PRI);
                Priority::Low
            }
        };

        self.enqueue_audit(factory::clone_task(parent, child, hook_id, flags), priority);
    }

    pub fn exit(&self, task: TaskInfo) {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_EXIT, &cfg) {
            return;
        }
        if task.is_thread() {
            return;
        }

        let mut flags = self.audit_flags(&task);
        flags.insert(REPORT_LO_PRI);
        self.enqueue_audit(factory::exit(task, flags), Priority::Low);
    }

    pub fn task_free(&self, task: TaskInfo) {
        let cfg = self.config.snapshot();
        if !self.hook_active(hook::HOOK_TASK_FREE, &cfg) {
            return;
        }
        if task.is_thread() {
            return;
        }

        let mut flags = self.audit_flags(&task);
        flags.insert(REPORT_LO_PRI);
        self.enqueue_audit(factory::task_free(task, flags), Priority::Low);
    }
}
