// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialization of events into the delivery stream format: header, fixed
//! message struct, then the inline NUL-terminated paths the message's
//! offset fields point at.

use std::mem::size_of;

use turnstile_common::{
    CloneMsg, CloseMsg, CreateMsg, CredMsg, DirRef, EventHeader, ExecMsg, FileMsg, LinkMsg,
    MmapMsg, OpenMsg, PtraceMsg, RenameMsg, SetattrMsg, SignalMsg, SymlinkMsg, TaskCtx, TaskMsg,
    UnlinkMsg, HEADER_SIZE,
};

use crate::event::{DirInfo, Event, EventPayload, FileInfo, TaskInfo};

fn push_struct<T: Copy>(buf: &mut Vec<u8>, value: &T) {
    let bytes =
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) };
    buf.extend_from_slice(bytes);
}

fn task_ctx(task: &TaskInfo) -> TaskCtx {
    TaskCtx {
        tid: task.tid,
        pid: task.pid,
        ppid: task.ppid,
        uid: task.uid,
        euid: task.euid,
        gid: task.gid,
        egid: task.egid,
    }
}

fn dir_ref(dir: &DirInfo) -> DirRef {
    DirRef {
        ino: dir.ino,
        dev: dir.dev,
    }
}

/// Collects the variable-length tail of a payload and hands out
/// payload-relative offsets for it.
struct PathArea {
    base: usize,
    bytes: Vec<u8>,
}

impl PathArea {
    fn new(base: usize) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    fn push(&mut self, path: &[u8]) -> (u16, u16) {
        if path.is_empty() {
            return (0, 0);
        }

        let offset = self.base + self.bytes.len();
        self.bytes.extend_from_slice(path);
        self.bytes.push(0);

        (offset as u16, (path.len() + 1) as u16)
    }

    fn file_msg(&mut self, file: &FileInfo) -> FileMsg {
        let (path_offset, path_size) = self.push(&file.path);

        FileMsg {
            ino: file.ino,
            size: file.size,
            dev: file.dev,
            uid: file.uid,
            gid: file.gid,
            mode: file.mode,
            path_offset,
            path_size,
        }
    }
}

pub fn encode(event: &Event) -> Vec<u8> {
    let task = task_ctx(&event.task);
    let mut msg = Vec::new();
    let mut tail = Vec::new();

    match &event.payload {
        EventPayload::Exec { file } => {
            let mut paths = PathArea::new(size_of::<ExecMsg>());
            let m = ExecMsg {
                task,
                file: paths.file_msg(file),
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Unlink { dir, file } => {
            let mut paths = PathArea::new(size_of::<UnlinkMsg>());
            let m = UnlinkMsg {
                task,
                dir: dir_ref(dir),
                file: paths.file_msg(file),
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Rename {
            old_dir,
            new_dir,
            old_file,
            new_file,
        } => {
            let mut paths = PathArea::new(size_of::<RenameMsg>());
            let m = RenameMsg {
                task,
                old_dir: dir_ref(old_dir),
                new_dir: dir_ref(new_dir),
                old_file: paths.file_msg(old_file),
                new_file: paths.file_msg(new_file),
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Setattr { attr, file } => {
            let mut paths = PathArea::new(size_of::<SetattrMsg>());
            let m = SetattrMsg {
                task,
                attr_mask: attr.mask,
                uid: attr.uid,
                gid: attr.gid,
                size: attr.size,
                mode: attr.mode,
                file: paths.file_msg(file),
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Create { dir, mode, file } => {
            let mut paths = PathArea::new(size_of::<CreateMsg>());
            let m = CreateMsg {
                task,
                dir: dir_ref(dir),
                mode: *mode,
                file: paths.file_msg(file),
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Link {
            old_file,
            new_dir,
            new_file,
        } => {
            let mut paths = PathArea::new(size_of::<LinkMsg>());
            let m = LinkMsg {
                task,
                old_file: paths.file_msg(old_file),
                new_dir: dir_ref(new_dir),
                new_file: paths.file_msg(new_file),
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Symlink { file, target } => {
            let mut paths = PathArea::new(size_of::<SymlinkMsg>());
            let file = paths.file_msg(file);
            let (target_offset, target_size) = paths.push(target);
            let m = SymlinkMsg {
                task,
                file,
                target_offset,
                target_size,
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Open {
            file,
            f_flags,
            f_mode,
        } => {
            let mut paths = PathArea::new(size_of::<OpenMsg>());
            let m = OpenMsg {
                task,
                file: paths.file_msg(file),
                f_flags: *f_flags,
                f_mode: *f_mode,
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Close {
            file,
            f_flags,
            f_mode,
        } => {
            let mut paths = PathArea::new(size_of::<CloseMsg>());
            let m = CloseMsg {
                task,
                file: paths.file_msg(file),
                f_flags: *f_flags,
                f_mode: *f_mode,
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Mmap { file, prot, flags } => {
            let mut paths = PathArea::new(size_of::<MmapMsg>());
            let file = match file {
                Some(file) => paths.file_msg(file),
                None => FileMsg::default(),
            };
            let m = MmapMsg {
                task,
                file,
                prot: *prot,
                flags: *flags,
            };
            push_struct(&mut msg, &m);
            tail = paths.bytes;
        }
        EventPayload::Ptrace { target } => {
            let m = PtraceMsg {
                source: task,
                target: task_ctx(target),
            };
            push_struct(&mut msg, &m);
        }
        EventPayload::Signal { target, signal } => {
            let m = SignalMsg {
                source: task,
                target: task_ctx(target),
                signal: *signal,
            };
            push_struct(&mut msg, &m);
        }
        EventPayload::Clone { child } => {
            let m = CloneMsg {
                parent: task,
                child: task_ctx(child),
            };
            push_struct(&mut msg, &m);
        }
        EventPayload::Task => {
            let m = TaskMsg { task };
            push_struct(&mut msg, &m);
        }
        EventPayload::Cred { old, new } => {
            let m = CredMsg {
                task,
                old_uid: old.uid,
                new_uid: new.uid,
                old_euid: old.euid,
                new_euid: new.euid,
                old_gid: old.gid,
                new_gid: new.gid,
                old_egid: old.egid,
                new_egid: new.egid,
            };
            push_struct(&mut msg, &m);
        }
    }

    let payload_len = msg.len() + tail.len();
    let header = EventHeader {
        request_id: event.request_id,
        tid: event.tid(),
        event_type: event.kind.as_u16(),
        hook_id: event.hook_id,
        report_flags: event.report_flags.0,
        payload_len: payload_len as u16,
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload_len);
    push_struct(&mut buf, &header);
    buf.extend_from_slice(&msg);
    buf.extend_from_slice(&tail);

    buf
}
