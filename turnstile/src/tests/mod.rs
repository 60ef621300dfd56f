// SPDX-License-Identifier: MIT OR Apache-2.0

mod hooks;
mod table;
mod wire;

use std::{sync::Arc, thread, time::Duration};

use turnstile_common::parse_header;

use crate::{
    config::ConfigSnapshot,
    event::{FileInfo, TaskInfo},
    mediator::{Mediator, MediatorOptions},
};

pub(crate) fn test_mediator(stall_timeout_ms: u32, deny_on_timeout: bool) -> Arc<Mediator> {
    let mediator = Arc::new(Mediator::new(MediatorOptions {
        queue_high_water: 1 << 20,
        initial: ConfigSnapshot {
            stall_mode: true,
            stall_timeout_ms,
            continue_timeout_ms: stall_timeout_ms,
            deny_on_timeout,
            ..Default::default()
        },
    }));
    mediator.table().set_enabled(true);
    mediator
}

pub(crate) fn task(tid: u32, pid: u32) -> TaskInfo {
    TaskInfo {
        tid,
        pid,
        ppid: 1,
        uid: 1000,
        euid: 1000,
        gid: 1000,
        egid: 1000,
    }
}

pub(crate) fn regular_file(path: &[u8], ino: u64) -> FileInfo {
    FileInfo {
        ino,
        dev: 0x801,
        mode: libc::S_IFREG as u16 | 0o644,
        uid: 1000,
        gid: 1000,
        size: 4096,
        path: path.to_vec(),
    }
}

/// Polls the delivery queues until an event shows up and returns its
/// request id. Used by the fake agents in the stall scenarios.
pub(crate) fn wait_for_request(mediator: &Mediator, cursor: &mut usize) -> u64 {
    for _ in 0..400 {
        let batch = mediator.table().dequeue_batch(cursor, 1 << 20);
        if let Some(bytes) = batch.first() {
            let header = parse_header(bytes).expect("delivered event parses");
            return header.request_id;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("no event was delivered");
}
