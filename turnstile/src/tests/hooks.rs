// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter-level behavior: filters, flags, cache short-circuits. These run
//! with no agent attached responses; anything that would stall uses the
//! caches or the audit path instead.

use turnstile_common::{
    event_type, hook, parse_header, ATTR_MODE, ATTR_SIZE, REPORT_LO_PRI, REPORT_SELF,
};

use crate::{
    cache::{InodeKey, TaskKey},
    event::{AttrChange, CredIds, DirInfo, Verdict},
    hooks::CloneOrigin,
    tests::{regular_file, task, test_mediator},
};

fn dir() -> DirInfo {
    DirInfo { ino: 2, dev: 0x801 }
}

#[test]
fn disabled_hook_is_a_no_op() {
    let mediator = test_mediator(100, false);
    mediator
        .config()
        .set_enabled_hooks(!hook::hook_mask(hook::HOOK_CLOSE));

    mediator.close(task(1, 1), &regular_file(b"/tmp/f", 3), 0, 0x3);
    assert_eq!(mediator.stats().snapshot().events_enqueued, 0);
}

#[test]
fn task_cache_hit_short_circuits_the_stall() {
    let mediator = test_mediator(5000, false);
    mediator.task_cache.insert(
        TaskKey {
            tgid: 9,
            kind: event_type::EVENT_UNLINK,
        },
        Verdict::Deny,
    );

    let verdict = mediator.unlink(task(9, 9), dir(), &regular_file(b"/tmp/f", 3));

    assert_eq!(verdict, Verdict::Deny);
    assert_eq!(mediator.stats().snapshot().task_cache_hits, 1);
    // No event was published at all.
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn inode_cache_hit_short_circuits_the_stall() {
    let mediator = test_mediator(5000, false);
    let file = regular_file(b"/usr/bin/vi", 42);
    mediator.inode_cache.insert(
        InodeKey {
            dev: file.dev,
            ino: file.ino,
            kind: event_type::EVENT_OPEN,
        },
        Verdict::Allow,
    );

    let verdict = mediator.open(task(9, 9), &file, libc::O_RDWR as u32, 0x3);

    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.stats().snapshot().inode_cache_hits, 1);
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn self_events_skip_the_caches() {
    let mediator = test_mediator(100, false);
    mediator.self_set().insert(9);
    mediator.task_cache.insert(
        TaskKey {
            tgid: 9,
            kind: event_type::EVENT_UNLINK,
        },
        Verdict::Deny,
    );

    // A cached DENY must not apply to the agent's own operations.
    let verdict = mediator.unlink(task(9, 9), dir(), &regular_file(b"/tmp/f", 3));
    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.stats().snapshot().task_cache_hits, 0);
}

#[test]
fn unlink_ignores_special_files() {
    let mediator = test_mediator(100, false);
    let mut fifo = regular_file(b"/tmp/fifo", 3);
    fifo.mode = libc::S_IFIFO as u16 | 0o644;

    let verdict = mediator.unlink(task(1, 1), dir(), &fifo);
    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn redundant_setattr_is_dropped() {
    let mediator = test_mediator(100, false);
    let file = regular_file(b"/tmp/f", 3);

    // Mode equals the current mode, nothing else requested.
    let verdict = mediator.setattr(
        task(1, 1),
        &file,
        AttrChange {
            mask: ATTR_MODE,
            mode: 0o644,
            ..Default::default()
        },
    );

    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn truncation_to_zero_of_an_empty_file_is_dropped() {
    let mediator = test_mediator(100, false);
    let mut file = regular_file(b"/tmp/f", 3);
    file.size = 0;

    let verdict = mediator.setattr(
        task(1, 1),
        &file,
        AttrChange {
            mask: ATTR_SIZE,
            size: 0,
            ..Default::default()
        },
    );

    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn truncation_of_a_nonempty_file_is_reported() {
    let mediator = test_mediator(100, false);
    mediator.self_set().insert(1); // audit only, no stall to wait out
    let file = regular_file(b"/tmp/f", 3);

    let verdict = mediator.setattr(
        task(1, 1),
        &file,
        AttrChange {
            mask: ATTR_SIZE,
            size: 0,
            ..Default::default()
        },
    );

    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 1);
}

#[test]
fn open_with_nonotify_readonly_is_dropped() {
    let mediator = test_mediator(100, false);
    let file = regular_file(b"/tmp/f", 3);

    let f_mode = 0x4000001; // FMODE_NONOTIFY | FMODE_READ
    let verdict = mediator.open(task(1, 1), &file, libc::O_RDONLY as u32, f_mode);

    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn mmap_without_exec_prot_is_dropped() {
    let mediator = test_mediator(100, false);
    let file = regular_file(b"/usr/lib/libc.so", 3);

    let verdict = mediator.mmap(
        task(1, 1),
        Some(&file),
        libc::PROT_READ as u64,
        libc::MAP_PRIVATE as u64,
        false,
    );

    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn anonymous_exec_mmap_is_reported_low_priority() {
    let mediator = test_mediator(100, false);

    let verdict = mediator.mmap(
        task(1, 1),
        None,
        (libc::PROT_READ | libc::PROT_EXEC) as u64,
        (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
        false,
    );
    assert_eq!(verdict, Verdict::Allow);

    let mut cursor = 0;
    let batch = mediator.table().dequeue_batch(&mut cursor, 1 << 20);
    assert_eq!(batch.len(), 1);
    let header = parse_header(&batch[0]).unwrap();
    let kind = header.event_type;
    assert_eq!(kind, event_type::EVENT_MMAP);
    assert_ne!(header.report_flags & REPORT_LO_PRI, 0);
}

#[test]
fn atomic_context_mmap_never_stalls() {
    let mediator = test_mediator(5000, false);
    let file = regular_file(b"/usr/bin/vi", 42);

    let started = std::time::Instant::now();
    let verdict = mediator.mmap(
        task(1, 1),
        Some(&file),
        libc::PROT_EXEC as u64,
        (libc::MAP_PRIVATE | libc::MAP_EXECUTABLE) as u64,
        true,
    );

    assert_eq!(verdict, Verdict::Allow);
    assert!(started.elapsed() < std::time::Duration::from_millis(100));
    assert_eq!(mediator.table().entry_count(), 0);
    assert_eq!(mediator.table().pending(), 1);
}

#[test]
fn ptrace_non_attach_is_dropped() {
    let mediator = test_mediator(100, false);

    let verdict = mediator.ptrace_access_check(task(1, 1), task(2, 2), 0x01);
    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 0);

    let verdict = mediator.ptrace_access_check(task(1, 1), task(2, 2), 0x02);
    assert_eq!(verdict, Verdict::Allow);
    assert_eq!(mediator.table().pending(), 1);
}

#[test]
fn agent_tracing_itself_is_not_reported() {
    let mediator = test_mediator(100, false);
    mediator.self_set().insert(1);
    mediator.self_set().insert(2);

    mediator.ptrace_access_check(task(1, 1), task(2, 2), 0x02);
    assert_eq!(mediator.table().pending(), 0);
}

#[test]
fn signal_zero_probe_is_dropped() {
    let mediator = test_mediator(100, false);

    mediator.signal(task(1, 1), task(2, 2), 0);
    assert_eq!(mediator.table().pending(), 0);

    mediator.signal(task(1, 1), task(2, 2), libc::SIGKILL as u32);
    assert_eq!(mediator.table().pending(), 1);
}

#[test]
fn thread_level_clone_and_exit_are_dropped() {
    let mediator = test_mediator(100, false);

    mediator.clone_task(task(1, 1), task(10, 5), CloneOrigin::Hook);
    mediator.exit(task(10, 5));
    assert_eq!(mediator.table().pending(), 0);

    mediator.clone_task(task(1, 1), task(10, 10), CloneOrigin::Hook);
    mediator.exit(task(10, 10));
    assert_eq!(mediator.table().pending(), 2);
}

#[test]
fn probe_sourced_clone_is_low_priority() {
    let mediator = test_mediator(100, false);

    mediator.clone_task(task(1, 1), task(10, 10), CloneOrigin::Probe);

    let mut cursor = 0;
    let batch = mediator.table().dequeue_batch(&mut cursor, 1 << 20);
    let header = parse_header(&batch[0]).unwrap();
    let hook_id = header.hook_id;
    assert_eq!(hook_id, hook::HOOK_CLONE_PROBE);
    assert_ne!(header.report_flags & REPORT_LO_PRI, 0);
}

#[test]
fn setuid_without_change_is_dropped() {
    let mediator = test_mediator(100, false);
    mediator.self_set().insert(1);

    let ids = CredIds {
        uid: 1000,
        euid: 1000,
        gid: 1000,
        egid: 1000,
    };
    mediator.setuid(task(1, 1), ids, ids);
    assert_eq!(mediator.table().pending(), 0);

    let root = CredIds {
        uid: 0,
        euid: 0,
        ..ids
    };
    mediator.setuid(task(1, 1), ids, root);
    assert_eq!(mediator.table().pending(), 1);
}

#[test]
fn close_events_carry_the_self_flag_for_the_agent() {
    let mediator = test_mediator(100, false);
    mediator.self_set().insert(7);

    mediator.close(task(7, 7), &regular_file(b"/tmp/f", 3), 0, 0x3);

    let mut cursor = 0;
    let batch = mediator.table().dequeue_batch(&mut cursor, 1 << 20);
    let header = parse_header(&batch[0]).unwrap();
    assert_ne!(header.report_flags & REPORT_SELF, 0);
}

#[test]
fn close_of_a_nonotify_readonly_open_is_dropped() {
    let mediator = test_mediator(100, false);
    let file = regular_file(b"/tmp/f", 3);

    let f_mode = 0x4000001; // FMODE_NONOTIFY | FMODE_READ
    mediator.close(task(1, 1), &file, libc::O_RDONLY as u32, f_mode);
    assert_eq!(mediator.table().pending(), 0);

    // Writable no-notify opens still report their close.
    mediator.close(task(1, 1), &file, libc::O_RDWR as u32, 0x4000003);
    assert_eq!(mediator.table().pending(), 1);
}

#[test]
fn per_kind_stall_disable_downgrades_to_audit() {
    let mediator = test_mediator(5000, false);
    mediator
        .config()
        .set_stall_disable_mask(1 << event_type::EVENT_EXEC);

    let started = std::time::Instant::now();
    let verdict = mediator.exec(task(1, 1), &regular_file(b"/bin/true", 7));

    assert_eq!(verdict, Verdict::Allow);
    assert!(started.elapsed() < std::time::Duration::from_millis(100));
    assert_eq!(mediator.table().entry_count(), 0);
    assert_eq!(mediator.table().pending(), 1);
}
