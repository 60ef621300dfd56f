// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialization checks, including full round trips through the client
//! crate's decoder.

use turnstile_common::{
    event_type, hook, parse_header, path_bytes, read_msg, ExecMsg, RenameMsg, HEADER_SIZE,
    REPORT_AUDIT, REPORT_STALL, RESPONSE_SIZE,
};
use turnstile_client::DecodedEvent;

use crate::{
    event::{CredIds, DirInfo, ReportFlags},
    factory,
    tests::{regular_file, task},
    wire,
};

#[test]
fn wire_struct_sizes_are_fixed() {
    assert_eq!(HEADER_SIZE, 20);
    assert_eq!(RESPONSE_SIZE, 16);
}

#[test]
fn exec_event_encodes_header_msg_and_path() {
    let mut event = factory::exec(
        task(42, 42),
        regular_file(b"/bin/true", 7),
        ReportFlags(REPORT_AUDIT | REPORT_STALL),
    );
    event.request_id = 5;

    let bytes = wire::encode(&event);
    let header = parse_header(&bytes).expect("valid header");

    let request_id = header.request_id;
    let tid = header.tid;
    let kind = header.event_type;
    let hook_id = header.hook_id;
    let payload_len = header.payload_len as usize;
    assert_eq!(request_id, 5);
    assert_eq!(tid, 42);
    assert_eq!(kind, event_type::EVENT_EXEC);
    assert_eq!(hook_id, hook::HOOK_EXEC);
    assert_eq!(bytes.len(), HEADER_SIZE + payload_len);

    let payload = &bytes[HEADER_SIZE..];
    let msg: ExecMsg = read_msg(payload).expect("exec msg");

    let msg_tid = msg.task.tid;
    let ino = msg.file.ino;
    let mode = msg.file.mode;
    assert_eq!(msg_tid, 42);
    assert_eq!(ino, 7);
    assert_eq!(mode, libc::S_IFREG as u16 | 0o644);

    let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size).unwrap();
    assert_eq!(path, b"/bin/true");
}

#[test]
fn rename_event_carries_both_paths() {
    let mut event = factory::rename(
        task(1, 1),
        DirInfo { ino: 2, dev: 3 },
        regular_file(b"/tmp/old", 10),
        DirInfo { ino: 4, dev: 3 },
        regular_file(b"/tmp/new", 11),
        ReportFlags(REPORT_AUDIT),
    );
    event.request_id = 9;

    let bytes = wire::encode(&event);
    let header = parse_header(&bytes).unwrap();
    let payload = &bytes[HEADER_SIZE..];
    let msg: RenameMsg = read_msg(payload).unwrap();

    let old = path_bytes(payload, msg.old_file.path_offset, msg.old_file.path_size).unwrap();
    let new = path_bytes(payload, msg.new_file.path_offset, msg.new_file.path_size).unwrap();
    assert_eq!(old, b"/tmp/old");
    assert_eq!(new, b"/tmp/new");

    // And through the client decoder.
    match turnstile_client::decode(&header, payload).expect("decodes") {
        DecodedEvent::Rename {
            old_path, new_path, ..
        } => {
            assert_eq!(old_path, b"/tmp/old");
            assert_eq!(new_path, b"/tmp/new");
        }
        other => panic!("wrong decode: {other:?}"),
    }
}

#[test]
fn symlink_event_carries_the_target() {
    let event = factory::symlink(
        task(1, 1),
        regular_file(b"/tmp/link", 10),
        b"/etc/passwd".to_vec(),
        ReportFlags(REPORT_AUDIT),
    );

    let bytes = wire::encode(&event);
    let header = parse_header(&bytes).unwrap();
    let payload = &bytes[HEADER_SIZE..];

    match turnstile_client::decode(&header, payload).unwrap() {
        DecodedEvent::Symlink { path, target, .. } => {
            assert_eq!(path, b"/tmp/link");
            assert_eq!(target, b"/etc/passwd");
        }
        other => panic!("wrong decode: {other:?}"),
    }
}

#[test]
fn anonymous_mmap_has_no_path() {
    let event = factory::mmap(
        task(1, 1),
        None,
        libc::PROT_EXEC as u64,
        libc::MAP_ANONYMOUS as u64,
        ReportFlags(REPORT_AUDIT),
    );

    let bytes = wire::encode(&event);
    let header = parse_header(&bytes).unwrap();
    let payload = &bytes[HEADER_SIZE..];

    match turnstile_client::decode(&header, payload).unwrap() {
        DecodedEvent::Mmap { msg, path } => {
            let ino = msg.file.ino;
            assert_eq!(ino, 0);
            assert!(path.is_empty());
        }
        other => panic!("wrong decode: {other:?}"),
    }
}

#[test]
fn cred_change_decodes() {
    let old = CredIds {
        uid: 1000,
        euid: 1000,
        gid: 1000,
        egid: 1000,
    };
    let new = CredIds {
        uid: 0,
        euid: 0,
        gid: 1000,
        egid: 1000,
    };
    let event = factory::setuid(task(1, 1), old, new, ReportFlags(REPORT_AUDIT)).unwrap();

    let bytes = wire::encode(&event);
    let header = parse_header(&bytes).unwrap();
    let payload = &bytes[HEADER_SIZE..];

    match turnstile_client::decode(&header, payload).unwrap() {
        DecodedEvent::Cred { msg } => {
            let old_uid = msg.old_uid;
            let new_euid = msg.new_euid;
            assert_eq!(old_uid, 1000);
            assert_eq!(new_euid, 0);
        }
        other => panic!("wrong decode: {other:?}"),
    }
}

#[test]
fn truncated_buffers_do_not_parse() {
    let mut event = factory::exec(
        task(42, 42),
        regular_file(b"/bin/true", 7),
        ReportFlags(REPORT_AUDIT),
    );
    event.request_id = 5;
    let bytes = wire::encode(&event);

    assert!(parse_header(&bytes[..HEADER_SIZE - 1]).is_none());
    // Header present but payload cut short.
    assert!(parse_header(&bytes[..bytes.len() - 1]).is_none());
}

#[test]
fn every_kind_decodes_through_the_client() {
    let flags = ReportFlags(REPORT_AUDIT);
    let t = task(1, 1);
    let d = DirInfo { ino: 2, dev: 3 };
    let f = || regular_file(b"/tmp/f", 10);

    let events = vec![
        factory::exec(t, f(), flags),
        factory::unlink(t, d, f(), flags),
        factory::rmdir(t, d, f(), flags),
        factory::rename(t, d, f(), d, f(), flags),
        factory::setattr(
            t,
            f(),
            crate::event::AttrChange {
                mask: turnstile_common::ATTR_MODE,
                mode: 0o600,
                ..Default::default()
            },
            flags,
        )
        .unwrap(),
        factory::mkdir(t, d, 0o755, f(), flags),
        factory::create(t, d, 0o644, f(), flags),
        factory::link(t, f(), d, f(), flags),
        factory::symlink(t, f(), b"/tmp/t".to_vec(), flags),
        factory::open(t, f(), 0, 0, flags),
        factory::close(t, f(), 0, 0x3, flags),
        factory::mmap(t, Some(f()), libc::PROT_EXEC as u64, 0, flags),
        factory::ptrace(t, task(2, 2), hook::HOOK_PTRACE_ACCESS, flags),
        factory::signal(t, task(2, 2), libc::SIGTERM as u32, flags),
        factory::clone_task(t, task(2, 2), hook::HOOK_CLONE, flags),
        factory::exit(t, flags),
        factory::task_free(t, flags),
        factory::setuid(t, CredIds::default(), CredIds { uid: 1, ..Default::default() }, flags)
            .unwrap(),
        factory::setgid(t, CredIds::default(), CredIds { gid: 1, ..Default::default() }, flags)
            .unwrap(),
    ];

    for event in events {
        let bytes = wire::encode(&event);
        let header = parse_header(&bytes).expect("header parses");
        let payload = &bytes[HEADER_SIZE..];
        assert!(
            turnstile_client::decode(&header, payload).is_some(),
            "kind {:?} failed to decode",
            event.kind
        );
    }
}
