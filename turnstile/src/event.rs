// SPDX-License-Identifier: MIT OR Apache-2.0

//! The in-flight event: an owned descriptor built at hook time, published
//! through the stall table and consumed by the delivery surface.

use turnstile_common::{event_type, REPORT_LO_PRI, REPORT_SELF, REPORT_STALL};

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Exec = event_type::EVENT_EXEC,
    Unlink = event_type::EVENT_UNLINK,
    Rmdir = event_type::EVENT_RMDIR,
    Rename = event_type::EVENT_RENAME,
    Setattr = event_type::EVENT_SETATTR,
    Mkdir = event_type::EVENT_MKDIR,
    Create = event_type::EVENT_CREATE,
    Link = event_type::EVENT_LINK,
    Symlink = event_type::EVENT_SYMLINK,
    Open = event_type::EVENT_OPEN,
    Close = event_type::EVENT_CLOSE,
    Mmap = event_type::EVENT_MMAP,
    Ptrace = event_type::EVENT_PTRACE,
    Signal = event_type::EVENT_SIGNAL,
    Clone = event_type::EVENT_CLONE,
    Exit = event_type::EVENT_EXIT,
    TaskFree = event_type::EVENT_TASK_FREE,
    Setuid = event_type::EVENT_SETUID,
    Setgid = event_type::EVENT_SETGID,
}

impl EventKind {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        event_type::event_type_name(self.as_u16())
    }
}

/// The hook's decision returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    /// Errno for the OS boundary: DENY maps to permission denied.
    pub fn errno(self) -> i32 {
        match self {
            Verdict::Allow => 0,
            Verdict::Deny => -libc::EPERM,
        }
    }
}

/// A decoded agent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Allow,
    Deny,
    Continue,
}

impl Response {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            turnstile_common::RESPONSE_ALLOW => Some(Response::Allow),
            turnstile_common::RESPONSE_DENY => Some(Response::Deny),
            turnstile_common::RESPONSE_CONTINUE => Some(Response::Continue),
            _ => None,
        }
    }

    /// Anything that is not an explicit DENY lets the operation proceed.
    pub fn verdict(self) -> Verdict {
        match self {
            Response::Deny => Verdict::Deny,
            _ => Verdict::Allow,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportFlags(pub u16);

impl ReportFlags {
    pub fn contains(self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    pub fn stall(self) -> bool {
        self.contains(REPORT_STALL)
    }

    pub fn self_origin(self) -> bool {
        self.contains(REPORT_SELF)
    }

    pub fn low_priority(self) -> bool {
        self.contains(REPORT_LO_PRI)
    }
}

/// Identity of the task driving a hook. `pid` is the thread-group id.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskInfo {
    pub tid: u32,
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

impl TaskInfo {
    /// Process-level check: thread-group leader only.
    pub fn is_thread(&self) -> bool {
        self.tid != self.pid
    }
}

/// A file as seen by a hook: identity, attributes and resolved path.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub ino: u64,
    pub dev: u32,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub path: Vec<u8>,
}

impl FileInfo {
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT as u16 == libc::S_IFREG as u16
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u16 == libc::S_IFDIR as u16
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT as u16 == libc::S_IFLNK as u16
    }
}

/// Requested attribute changes for a setattr hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrChange {
    pub mask: u32,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirInfo {
    pub ino: u64,
    pub dev: u32,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Exec {
        file: FileInfo,
    },
    Unlink {
        dir: DirInfo,
        file: FileInfo,
    },
    Rename {
        old_dir: DirInfo,
        new_dir: DirInfo,
        old_file: FileInfo,
        new_file: FileInfo,
    },
    Setattr {
        attr: AttrChange,
        file: FileInfo,
    },
    Create {
        dir: DirInfo,
        mode: u16,
        file: FileInfo,
    },
    Link {
        old_file: FileInfo,
        new_dir: DirInfo,
        new_file: FileInfo,
    },
    Symlink {
        file: FileInfo,
        target: Vec<u8>,
    },
    Open {
        file: FileInfo,
        f_flags: u32,
        f_mode: u32,
    },
    Close {
        file: FileInfo,
        f_flags: u32,
        f_mode: u32,
    },
    Mmap {
        file: Option<FileInfo>,
        prot: u64,
        flags: u64,
    },
    Ptrace {
        target: TaskInfo,
    },
    Signal {
        target: TaskInfo,
        signal: u32,
    },
    Clone {
        child: TaskInfo,
    },
    Task,
    Cred {
        old: CredIds,
        new: CredIds,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CredIds {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

/// An event owns its payload and moves: factory -> table -> delivery queue.
/// Request ids are assigned by the stall table at publication; a zero id
/// means the event was never published.
#[derive(Debug, Clone)]
pub struct Event {
    pub request_id: u64,
    pub kind: EventKind,
    pub hook_id: u16,
    pub report_flags: ReportFlags,
    pub task: TaskInfo,
    pub payload: EventPayload,
}

impl Event {
    pub fn tid(&self) -> u32 {
        self.task.tid
    }

    /// Identity of the primary file object, when the kind has one.
    pub fn file_identity(&self) -> Option<(u32, u64)> {
        let file = match &self.payload {
            EventPayload::Exec { file } => file,
            EventPayload::Unlink { file, .. } => file,
            EventPayload::Rename { old_file, .. } => old_file,
            EventPayload::Setattr { file, .. } => file,
            EventPayload::Create { file, .. } => file,
            EventPayload::Link { old_file, .. } => old_file,
            EventPayload::Symlink { file, .. } => file,
            EventPayload::Open { file, .. } => file,
            EventPayload::Close { file, .. } => file,
            EventPayload::Mmap { file: Some(file), .. } => file,
            _ => return None,
        };

        Some((file.dev, file.ino))
    }
}
