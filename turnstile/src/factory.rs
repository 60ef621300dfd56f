// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event construction. One function per kind; the few that can discover
//! mid-build that there is nothing to report return `None` and the adapter
//! drops the operation without publishing anything.

use turnstile_common::{hook, ATTR_GID, ATTR_MODE, ATTR_SIZE, ATTR_UID};

use crate::event::{
    AttrChange, CredIds, DirInfo, Event, EventKind, EventPayload, FileInfo, ReportFlags, TaskInfo,
};

fn event(
    kind: EventKind,
    hook_id: u16,
    task: TaskInfo,
    report_flags: ReportFlags,
    payload: EventPayload,
) -> Event {
    Event {
        request_id: 0,
        kind,
        hook_id,
        report_flags,
        task,
        payload,
    }
}

pub fn exec(task: TaskInfo, file: FileInfo, flags: ReportFlags) -> Event {
    event(
        EventKind::Exec,
        hook::HOOK_EXEC,
        task,
        flags,
        EventPayload::Exec { file },
    )
}

pub fn unlink(task: TaskInfo, dir: DirInfo, file: FileInfo, flags: ReportFlags) -> Event {
    event(
        EventKind::Unlink,
        hook::HOOK_UNLINK,
        task,
        flags,
        EventPayload::Unlink { dir, file },
    )
}

pub fn rmdir(task: TaskInfo, dir: DirInfo, file: FileInfo, flags: ReportFlags) -> Event {
    event(
        EventKind::Rmdir,
        hook::HOOK_RMDIR,
        task,
        flags,
        EventPayload::Unlink { dir, file },
    )
}

pub fn rename(
    task: TaskInfo,
    old_dir: DirInfo,
    old_file: FileInfo,
    new_dir: DirInfo,
    new_file: FileInfo,
    flags: ReportFlags,
) -> Event {
    event(
        EventKind::Rename,
        hook::HOOK_RENAME,
        task,
        flags,
        EventPayload::Rename {
            old_dir,
            new_dir,
            old_file,
            new_file,
        },
    )
}

/// `None` when the masked attributes all match the file's current state;
/// such a setattr changes nothing worth reporting. A size of zero is only
/// an interesting truncation when the file is not already empty.
pub fn setattr(
    task: TaskInfo,
    file: FileInfo,
    attr: AttrChange,
    flags: ReportFlags,
) -> Option<Event> {
    let mut mask = attr.mask & (ATTR_MODE | ATTR_UID | ATTR_GID | ATTR_SIZE);

    if mask & ATTR_MODE != 0 && attr.mode == file.mode & 0o7777 {
        mask &= !ATTR_MODE;
    }
    if mask & ATTR_UID != 0 && attr.uid == file.uid {
        mask &= !ATTR_UID;
    }
    if mask & ATTR_GID != 0 && attr.gid == file.gid {
        mask &= !ATTR_GID;
    }
    if mask & ATTR_SIZE != 0 && attr.size == file.size {
        mask &= !ATTR_SIZE;
    }

    if mask == 0 {
        return None;
    }

    let attr = AttrChange { mask, ..attr };
    Some(event(
        EventKind::Setattr,
        hook::HOOK_SETATTR,
        task,
        flags,
        EventPayload::Setattr { attr, file },
    ))
}

pub fn mkdir(
    task: TaskInfo,
    dir: DirInfo,
    mode: u16,
    file: FileInfo,
    flags: ReportFlags,
) -> Event {
    event(
        EventKind::Mkdir,
        hook::HOOK_MKDIR,
        task,
        flags,
        EventPayload::Create { dir, mode, file },
    )
}

pub fn create(
    task: TaskInfo,
    dir: DirInfo,
    mode: u16,
    file: FileInfo,
    flags: ReportFlags,
) -> Event {
    event(
        EventKind::Create,
        hook::HOOK_CREATE,
        task,
        flags,
        EventPayload::Create { dir, mode, file },
    )
}

pub fn link(
    task: TaskInfo,
    old_file: FileInfo,
    new_dir: DirInfo,
    new_file: FileInfo,
    flags: ReportFlags,
) -> Event {
    event(
        EventKind::Link,
        hook::HOOK_LINK,
        task,
        flags,
        EventPayload::Link {
            old_file,
            new_dir,
            new_file,
        },
    )
}

pub fn symlink(task: TaskInfo, file: FileInfo, target: Vec<u8>, flags: ReportFlags) -> Event {
    event(
        EventKind::Symlink,
        hook::HOOK_SYMLINK,
        task,
        flags,
        EventPayload::Symlink { file, target },
    )
}

pub fn open(
    task: TaskInfo,
    file: FileInfo,
    f_flags: u32,
    f_mode: u32,
    flags: ReportFlags,
) -> Event {
    event(
        EventKind::Open,
        hook::HOOK_OPEN,
        task,
        flags,
        EventPayload::Open {
            file,
            f_flags,
            f_mode,
        },
    )
}

pub fn close(
    task: TaskInfo,
    file: FileInfo,
    f_flags: u32,
    f_mode: u32,
    flags: ReportFlags,
) -> Event {
    event(
        EventKind::Close,
        hook::HOOK_CLOSE,
        task,
        flags,
        EventPayload::Close {
            file,
            f_flags,
            f_mode,
        },
    )
}

pub fn mmap(
    task: TaskInfo,
    file: Option<FileInfo>,
    prot: u64,
    map_flags: u64,
    flags: ReportFlags,
) -> Event {
    event(
        EventKind::Mmap,
        hook::HOOK_MMAP,
        task,
        flags,
        EventPayload::Mmap {
            file,
            prot,
            flags: map_flags,
        },
    )
}

pub fn ptrace(source: TaskInfo, target: TaskInfo, hook_id: u16, flags: ReportFlags) -> Event {
    event(
        EventKind::Ptrace,
        hook_id,
        source,
        flags,
        EventPayload::Ptrace { target },
    )
}

pub fn signal(source: TaskInfo, target: TaskInfo, sig: u32, flags: ReportFlags) -> Event {
    event(
        EventKind::Signal,
        hook::HOOK_SIGNAL,
        source,
        flags,
        EventPayload::Signal {
            target,
            signal: sig,
        },
    )
}

pub fn clone_task(parent: TaskInfo, child: TaskInfo, hook_id: u16, flags: ReportFlags) -> Event {
    event(
        EventKind::Clone,
        hook_id,
        parent,
        flags,
        EventPayload::Clone { child },
    )
}

pub fn exit(task: TaskInfo, flags: ReportFlags) -> Event {
    event(EventKind::Exit, hook::HOOK_EXIT, task, flags, EventPayload::Task)
}

pub fn task_free(task: TaskInfo, flags: ReportFlags) -> Event {
    event(
        EventKind::TaskFree,
        hook::HOOK_TASK_FREE,
        task,
        flags,
        EventPayload::Task,
    )
}

/// `None` when no user id actually changes.
pub fn setuid(task: TaskInfo, old: CredIds, new: CredIds, flags: ReportFlags) -> Option<Event> {
    if old.uid == new.uid && old.euid == new.euid {
        return None;
    }

    Some(event(
        EventKind::Setuid,
        hook::HOOK_SETUID,
        task,
        flags,
        EventPayload::Cred { old, new },
    ))
}

/// `None` when no group id actually changes.
pub fn setgid(task: TaskInfo, old: CredIds, new: CredIds, flags: ReportFlags) -> Option<Event> {
    if old.gid == new.gid && old.egid == new.egid {
        return None;
    }

    Some(event(
        EventKind::Setgid,
        hook::HOOK_SETGID,
        task,
        flags,
        EventPayload::Cred { old, new },
    ))
}
