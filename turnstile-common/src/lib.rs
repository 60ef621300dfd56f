// SPDX-License-Identifier: MIT OR Apache-2.0

#![no_std]

//! Wire format shared between the mediation daemon and the decision agent.
//!
//! Every event delivered on the stream is an [`EventHeader`] immediately
//! followed by `payload_len` bytes: one of the `*Msg` structs below plus any
//! inline path bytes. Paths are NUL-terminated; offsets are relative to the
//! start of the payload (not the header). All integers are host-endian.

use core::mem::size_of;

pub mod event_type;
pub mod hook;

pub const HEADER_SIZE: usize = size_of::<EventHeader>();
pub const RESPONSE_SIZE: usize = size_of::<ResponseMsg>();

// Report flags carried in EventHeader::report_flags.
pub const REPORT_AUDIT: u16 = 1 << 0;
pub const REPORT_STALL: u16 = 1 << 1;
pub const REPORT_SELF: u16 = 1 << 2;
pub const REPORT_IGNORE: u16 = 1 << 3;
pub const REPORT_LO_PRI: u16 = 1 << 4;

// Response codes accepted from the agent.
pub const RESPONSE_ALLOW: u32 = 0;
pub const RESPONSE_DENY: u32 = 1;
pub const RESPONSE_CONTINUE: u32 = 2;

// Control request flags: which config fields a Configure call applies.
pub const STALL_MODE_SET: u32 = 1 << 0;
pub const STALL_DEFAULT_TIMEOUT: u32 = 1 << 1;
pub const STALL_CONTINUE_TIMEOUT: u32 = 1 << 2;
pub const STALL_DEFAULT_DENY: u32 = 1 << 3;
pub const BYPASS_MODE_SET: u32 = 1 << 4;
pub const IGNORE_MODE_SET: u32 = 1 << 5;

// Timeout bounds. Control requests are clamped into these, never rejected.
pub const MIN_WAIT_TIMEOUT_MS: u32 = 50;
pub const MAX_WAIT_TIMEOUT_MS: u32 = 15_000;
pub const MAX_EXTENDED_TIMEOUT_MS: u32 = 60_000;
pub const DEFAULT_STALL_TIMEOUT_MS: u32 = 1_000;
pub const DEFAULT_CONTINUE_TIMEOUT_MS: u32 = 5_000;

/// Upper bound on CONTINUE responses for a single event.
pub const MAX_CONTINUE_RESPONSES: u32 = 256;

// Setattr attribute mask, kernel iattr values.
pub const ATTR_MODE: u32 = 1 << 0;
pub const ATTR_UID: u32 = 1 << 1;
pub const ATTR_GID: u32 = 1 << 2;
pub const ATTR_SIZE: u32 = 1 << 3;

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EventHeader {
    pub request_id: u64,
    pub tid: u32,
    pub event_type: u16,
    pub hook_id: u16,
    pub report_flags: u16,
    pub payload_len: u16,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseMsg {
    pub request_id: u64,
    pub response: u32,
    pub continue_timeout_ms: u32,
}

/// Identity of the task the event originated from.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskCtx {
    pub tid: u32,
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
}

/// A file involved in the operation. `path_offset`/`path_size` locate the
/// NUL-terminated path within the payload; `path_size` includes the NUL and
/// is zero when no path was resolved.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FileMsg {
    pub ino: u64,
    pub size: u64,
    pub dev: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub path_offset: u16,
    pub path_size: u16,
}

/// Parent directory reference, identity only.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DirRef {
    pub ino: u64,
    pub dev: u32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecMsg {
    pub task: TaskCtx,
    pub file: FileMsg,
}

/// Shared by UNLINK and RMDIR; the hook id tells them apart.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlinkMsg {
    pub task: TaskCtx,
    pub dir: DirRef,
    pub file: FileMsg,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RenameMsg {
    pub task: TaskCtx,
    pub old_dir: DirRef,
    pub new_dir: DirRef,
    pub old_file: FileMsg,
    pub new_file: FileMsg,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SetattrMsg {
    pub task: TaskCtx,
    pub attr_mask: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mode: u16,
    pub file: FileMsg,
}

/// Shared by MKDIR and CREATE; the hook id tells them apart.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateMsg {
    pub task: TaskCtx,
    pub dir: DirRef,
    pub mode: u16,
    pub file: FileMsg,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkMsg {
    pub task: TaskCtx,
    pub old_file: FileMsg,
    pub new_dir: DirRef,
    pub new_file: FileMsg,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SymlinkMsg {
    pub task: TaskCtx,
    pub file: FileMsg,
    pub target_offset: u16,
    pub target_size: u16,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenMsg {
    pub task: TaskCtx,
    pub file: FileMsg,
    pub f_flags: u32,
    pub f_mode: u32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CloseMsg {
    pub task: TaskCtx,
    pub file: FileMsg,
    pub f_flags: u32,
    pub f_mode: u32,
}

/// Anonymous mappings carry a zeroed `file` with `path_size == 0`.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapMsg {
    pub task: TaskCtx,
    pub file: FileMsg,
    pub prot: u64,
    pub flags: u64,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PtraceMsg {
    pub source: TaskCtx,
    pub target: TaskCtx,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalMsg {
    pub source: TaskCtx,
    pub target: TaskCtx,
    pub signal: u32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CloneMsg {
    pub parent: TaskCtx,
    pub child: TaskCtx,
}

/// Shared by EXIT and TASK_FREE; the hook id tells them apart.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskMsg {
    pub task: TaskCtx,
}

/// Shared by SETUID and SETGID; the hook id tells them apart.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CredMsg {
    pub task: TaskCtx,
    pub old_uid: u32,
    pub new_uid: u32,
    pub old_euid: u32,
    pub new_euid: u32,
    pub old_gid: u32,
    pub new_gid: u32,
    pub old_egid: u32,
    pub new_egid: u32,
}

/// Reads the event header off the front of `bytes`. Returns `None` when the
/// buffer is short or the advertised payload does not fit.
pub fn parse_header(bytes: &[u8]) -> Option<EventHeader> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }

    let header = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const EventHeader) };

    let total = HEADER_SIZE.checked_add(header.payload_len as usize)?;
    if bytes.len() < total {
        return None;
    }

    Some(header)
}

/// Reads a fixed-size message struct off the front of a payload.
pub fn read_msg<T: Copy>(payload: &[u8]) -> Option<T> {
    if payload.len() < size_of::<T>() {
        return None;
    }

    Some(unsafe { core::ptr::read_unaligned(payload.as_ptr() as *const T) })
}

/// Extracts a path from a payload given its offset/size pair, dropping the
/// trailing NUL. A zero `size` means no path and yields an empty slice.
pub fn path_bytes(payload: &[u8], offset: u16, size: u16) -> Option<&[u8]> {
    if size == 0 {
        return Some(&[]);
    }

    let start = offset as usize;
    let end = start.checked_add(size as usize)?;
    if end > payload.len() {
        return None;
    }

    let raw = &payload[start..end];
    match raw.last() {
        Some(0) => Some(&raw[..raw.len() - 1]),
        _ => None,
    }
}

pub fn parse_response(bytes: &[u8]) -> Option<ResponseMsg> {
    if bytes.len() < RESPONSE_SIZE {
        return None;
    }

    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const ResponseMsg) })
}
