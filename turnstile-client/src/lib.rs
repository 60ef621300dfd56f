// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agent-side library: connect to the mediation daemon, read the event
//! stream, send verdicts and control requests back.

use std::{
    fs::File,
    io::Read as _,
    os::fd::OwnedFd,
};

use turnstile_common::{
    event_type, parse_header, path_bytes, read_msg, CloneMsg, CloseMsg, CreateMsg, CredMsg,
    EventHeader, ExecMsg, LinkMsg, MmapMsg, OpenMsg, PtraceMsg, RenameMsg, ResponseMsg, SetattrMsg,
    SignalMsg, SymlinkMsg, TaskMsg, UnlinkMsg, HEADER_SIZE, RESPONSE_ALLOW, RESPONSE_CONTINUE,
    RESPONSE_DENY, STALL_CONTINUE_TIMEOUT, STALL_DEFAULT_DENY, STALL_DEFAULT_TIMEOUT,
    STALL_MODE_SET,
};
use zbus::{names::WellKnownName, proxy, Connection};

#[proxy(
    interface = "org.turnstile.Mediator",
    default_path = "/org/turnstile/Mediator"
)]
pub trait Mediator {
    fn take_event_stream(&self, tgid: u32) -> zbus::Result<zbus::zvariant::OwnedFd>;

    fn respond(&self, request_id: u64, response: u32, continuation_timeout_ms: u32)
        -> zbus::Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn configure(
        &self,
        flags: u32,
        stall_mode: u32,
        stall_timeout_ms: u32,
        continue_timeout_ms: u32,
        deny_on_timeout: u32,
        bypass_mode: u32,
        ignore_mode: u32,
    ) -> zbus::Result<()>;

    fn stats(&self) -> zbus::Result<String>;
}

pub async fn connect<'d>() -> zbus::Result<MediatorProxy<'d>> {
    let (connection, bus_type) = match std::env::var("TURNSTILED_USE_SESSION_BUS") {
        Ok(value) if value == "true" => (Connection::session().await?, "session"),
        _ => (Connection::system().await?, "system"),
    };

    log::trace!("Connected to {bus_type} bus");

    let destination = WellKnownName::try_from("org.turnstile.Mediator")?;
    MediatorProxy::new(&connection, destination).await
}

/// Registers this process as the decision agent and returns the proxy plus
/// the raw event stream.
pub async fn attach<'d>() -> zbus::Result<(MediatorProxy<'d>, EventStream)> {
    let proxy = connect().await?;
    let fd: OwnedFd = proxy.take_event_stream(std::process::id()).await?.into();

    Ok((proxy, EventStream::new(File::from(fd))))
}

impl MediatorProxy<'_> {
    pub async fn allow(&self, request_id: u64) -> zbus::Result<()> {
        self.respond(request_id, RESPONSE_ALLOW, 0).await
    }

    pub async fn deny(&self, request_id: u64) -> zbus::Result<()> {
        self.respond(request_id, RESPONSE_DENY, 0).await
    }

    pub async fn continue_stall(&self, request_id: u64, timeout_ms: u32) -> zbus::Result<()> {
        self.respond(request_id, RESPONSE_CONTINUE, timeout_ms).await
    }

    pub async fn send_response(&self, msg: &ResponseMsg) -> zbus::Result<()> {
        let ResponseMsg {
            request_id,
            response,
            continue_timeout_ms,
        } = *msg;
        self.respond(request_id, response, continue_timeout_ms)
            .await
    }

    /// Turns stalling on with the given timeouts.
    pub async fn enable_stalling(
        &self,
        stall_timeout_ms: u32,
        continue_timeout_ms: u32,
        deny_on_timeout: bool,
    ) -> zbus::Result<()> {
        self.configure(
            STALL_MODE_SET | STALL_DEFAULT_TIMEOUT | STALL_CONTINUE_TIMEOUT | STALL_DEFAULT_DENY,
            1,
            stall_timeout_ms,
            continue_timeout_ms,
            deny_on_timeout as u32,
            0,
            0,
        )
        .await
    }

    pub async fn disable_stalling(&self) -> zbus::Result<()> {
        self.configure(STALL_MODE_SET, 0, 0, 0, 0, 0, 0).await
    }
}

/// One event pulled off the stream: the header plus its raw payload.
#[derive(Debug, Clone)]
pub struct WireEvent {
    pub header: EventHeader,
    pub payload: Vec<u8>,
}

impl WireEvent {
    pub fn decode(&self) -> Option<DecodedEvent> {
        decode(&self.header, &self.payload)
    }
}

/// Incremental reader over the event pipe. Blocking, like the stream
/// consumer side of the daemon's pipe contract.
pub struct EventStream {
    file: File,
    buf: Vec<u8>,
}

impl EventStream {
    pub fn new(file: File) -> Self {
        Self {
            file,
            buf: Vec::new(),
        }
    }

    /// Blocks until a full event is available. `None` on EOF (daemon gone).
    pub fn next_event(&mut self) -> std::io::Result<Option<WireEvent>> {
        loop {
            if let Some(event) = self.try_parse() {
                return Ok(Some(event));
            }

            let mut chunk = [0u8; 4096];
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_parse(&mut self) -> Option<WireEvent> {
        let header = parse_header(&self.buf)?;
        let total = HEADER_SIZE + header.payload_len as usize;

        let payload = self.buf[HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);

        Some(WireEvent { header, payload })
    }
}

/// Typed view of an event payload with paths copied out.
#[derive(Debug, Clone)]
pub enum DecodedEvent {
    Exec {
        msg: ExecMsg,
        path: Vec<u8>,
    },
    Unlink {
        msg: UnlinkMsg,
        path: Vec<u8>,
    },
    Rename {
        msg: RenameMsg,
        old_path: Vec<u8>,
        new_path: Vec<u8>,
    },
    Setattr {
        msg: SetattrMsg,
        path: Vec<u8>,
    },
    Create {
        msg: CreateMsg,
        path: Vec<u8>,
    },
    Link {
        msg: LinkMsg,
        old_path: Vec<u8>,
        new_path: Vec<u8>,
    },
    Symlink {
        msg: SymlinkMsg,
        path: Vec<u8>,
        target: Vec<u8>,
    },
    Open {
        msg: OpenMsg,
        path: Vec<u8>,
    },
    Close {
        msg: CloseMsg,
        path: Vec<u8>,
    },
    Mmap {
        msg: MmapMsg,
        path: Vec<u8>,
    },
    Ptrace {
        msg: PtraceMsg,
    },
    Signal {
        msg: SignalMsg,
    },
    Clone {
        msg: CloneMsg,
    },
    Task {
        msg: TaskMsg,
    },
    Cred {
        msg: CredMsg,
    },
}

pub fn decode(header: &EventHeader, payload: &[u8]) -> Option<DecodedEvent> {
    let decoded = match header.event_type {
        event_type::EVENT_EXEC => {
            let msg: ExecMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            DecodedEvent::Exec { msg, path }
        }
        event_type::EVENT_UNLINK | event_type::EVENT_RMDIR => {
            let msg: UnlinkMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            DecodedEvent::Unlink { msg, path }
        }
        event_type::EVENT_RENAME => {
            let msg: RenameMsg = read_msg(payload)?;
            let old_path =
                path_bytes(payload, msg.old_file.path_offset, msg.old_file.path_size)?.to_vec();
            let new_path =
                path_bytes(payload, msg.new_file.path_offset, msg.new_file.path_size)?.to_vec();
            DecodedEvent::Rename {
                msg,
                old_path,
                new_path,
            }
        }
        event_type::EVENT_SETATTR => {
            let msg: SetattrMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            DecodedEvent::Setattr { msg, path }
        }
        event_type::EVENT_MKDIR | event_type::EVENT_CREATE => {
            let msg: CreateMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            DecodedEvent::Create { msg, path }
        }
        event_type::EVENT_LINK => {
            let msg: LinkMsg = read_msg(payload)?;
            let old_path =
                path_bytes(payload, msg.old_file.path_offset, msg.old_file.path_size)?.to_vec();
            let new_path =
                path_bytes(payload, msg.new_file.path_offset, msg.new_file.path_size)?.to_vec();
            DecodedEvent::Link {
                msg,
                old_path,
                new_path,
            }
        }
        event_type::EVENT_SYMLINK => {
            let msg: SymlinkMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            let target = path_bytes(payload, msg.target_offset, msg.target_size)?.to_vec();
            DecodedEvent::Symlink { msg, path, target }
        }
        event_type::EVENT_OPEN => {
            let msg: OpenMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            DecodedEvent::Open { msg, path }
        }
        event_type::EVENT_CLOSE => {
            let msg: CloseMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            DecodedEvent::Close { msg, path }
        }
        event_type::EVENT_MMAP => {
            let msg: MmapMsg = read_msg(payload)?;
            let path = path_bytes(payload, msg.file.path_offset, msg.file.path_size)?.to_vec();
            DecodedEvent::Mmap { msg, path }
        }
        event_type::EVENT_PTRACE => {
            let msg: PtraceMsg = read_msg(payload)?;
            DecodedEvent::Ptrace { msg }
        }
        event_type::EVENT_SIGNAL => {
            let msg: SignalMsg = read_msg(payload)?;
            DecodedEvent::Signal { msg }
        }
        event_type::EVENT_CLONE => {
            let msg: CloneMsg = read_msg(payload)?;
            DecodedEvent::Clone { msg }
        }
        event_type::EVENT_EXIT | event_type::EVENT_TASK_FREE => {
            let msg: TaskMsg = read_msg(payload)?;
            DecodedEvent::Task { msg }
        }
        event_type::EVENT_SETUID | event_type::EVENT_SETGID => {
            let msg: CredMsg = read_msg(payload)?;
            DecodedEvent::Cred { msg }
        }
        _ => return None,
    };

    Some(decoded)
}
