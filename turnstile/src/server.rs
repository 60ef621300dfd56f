// SPDX-License-Identifier: MIT OR Apache-2.0

//! The delivery surface: a D-Bus service that hands the decision agent a
//! pipe carrying serialized events and takes responses and control
//! requests back as method calls.

use std::{
    io::{pipe, PipeWriter, Write as _},
    sync::Arc,
    time::Duration,
};

use log::{info, trace, warn};
use parking_lot::Mutex;
use zbus::zvariant::Fd;

use crate::{
    config::ControlRequest,
    event::Response,
    mediator::Mediator,
};

pub const SERVICE_NAME: &str = "org.turnstile.Mediator";
pub const OBJECT_PATH: &str = "/org/turnstile/Mediator";

/// How much the drain loop hands to the pipe per write burst.
const BATCH_BYTES: usize = 64 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(100);

struct AgentSlot {
    tgid: Option<u32>,
}

pub struct MediatorDBus {
    mediator: Arc<Mediator>,
    agent: Arc<Mutex<AgentSlot>>,
}

impl MediatorDBus {
    pub fn new(mediator: Arc<Mediator>) -> Self {
        Self {
            mediator,
            agent: Arc::new(Mutex::new(AgentSlot { tgid: None })),
        }
    }
}

#[zbus::interface(name = "org.turnstile.Mediator")]
impl MediatorDBus {
    /// Registers the calling agent and returns the read end of the event
    /// stream. One agent at a time; the connection is torn down when the
    /// agent closes its end.
    async fn take_event_stream(&mut self, tgid: u32) -> zbus::fdo::Result<Fd> {
        let (read, write) = match pipe() {
            Ok(pair) => pair,
            Err(e) => return Err(zbus::fdo::Error::Failed(e.to_string())),
        };

        {
            let mut agent = self.agent.lock();
            if agent.tgid.is_some() {
                return Err(zbus::fdo::Error::LimitsExceeded(
                    "an agent is already connected".into(),
                ));
            }
            agent.tgid = Some(tgid);
        }

        self.mediator.agent_attach(tgid);

        let mediator = self.mediator.clone();
        let slot = self.agent.clone();
        tokio::task::spawn_blocking(move || drain_loop(mediator, slot, write, tgid));

        Ok(Fd::from(std::os::fd::OwnedFd::from(read)))
    }

    /// Routes a verdict (or continuation) to the stalled task. Unknown
    /// request ids are fine; the waiter may have timed out already.
    async fn respond(
        &self,
        request_id: u64,
        response: u32,
        continuation_timeout_ms: u32,
    ) -> zbus::fdo::Result<()> {
        let Some(response) = Response::from_wire(response) else {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
                "unknown response code {response}"
            )));
        };

        self.mediator
            .apply_response(request_id, response, continuation_timeout_ms);

        Ok(())
    }

    /// Applies a control request. `flags` selects the fields that apply;
    /// out-of-range values are clamped, not refused. Privilege is enforced
    /// by the bus policy.
    #[allow(clippy::too_many_arguments)]
    async fn configure(
        &self,
        flags: u32,
        stall_mode: u32,
        stall_timeout_ms: u32,
        continue_timeout_ms: u32,
        deny_on_timeout: u32,
        bypass_mode: u32,
        ignore_mode: u32,
    ) -> zbus::fdo::Result<()> {
        self.mediator.configure(&ControlRequest {
            flags,
            stall_mode,
            stall_timeout_ms,
            continue_timeout_ms,
            deny_on_timeout,
            bypass_mode,
            ignore_mode,
        });

        Ok(())
    }

    async fn stats(&self) -> String {
        self.mediator.stats().snapshot().summary()
    }
}

/// Pulls batches out of the stall table and writes them to the agent's
/// pipe. Runs on a blocking thread; the table is a synchronous structure.
fn drain_loop(mediator: Arc<Mediator>, slot: Arc<Mutex<AgentSlot>>, writer: PipeWriter, tgid: u32) {
    let mut writer = writer;
    let mut cursor = 0usize;

    loop {
        if !mediator.table().enabled() {
            break;
        }

        if !mediator.table().wait_for_events(DRAIN_POLL) {
            continue;
        }

        for chunk in mediator.table().dequeue_batch(&mut cursor, BATCH_BYTES) {
            trace!("delivering {} bytes", chunk.len());
            if let Err(e) = writer.write_all(&chunk) {
                warn!("event stream write failed, detaching agent: {e}");
                detach(&mediator, &slot, tgid);
                return;
            }
        }
    }

    detach(&mediator, &slot, tgid);
}

fn detach(mediator: &Mediator, slot: &Mutex<AgentSlot>, tgid: u32) {
    let mut agent = slot.lock();
    if agent.tgid == Some(tgid) {
        agent.tgid = None;
        mediator.agent_detach(tgid);
    }
}

/// Starts the service on the system bus (session bus when
/// `TURNSTILED_USE_SESSION_BUS=true`, mainly for tests).
pub async fn serve(mediator: Arc<Mediator>) -> anyhow::Result<zbus::Connection> {
    let iface = MediatorDBus::new(mediator);

    let conn = match std::env::var("TURNSTILED_USE_SESSION_BUS") {
        Ok(value) if value == "true" => zbus::Connection::session().await?,
        _ => zbus::Connection::system().await?,
    };

    conn.object_server().at(OBJECT_PATH, iface).await?;
    conn.request_name(SERVICE_NAME).await?;

    info!("mediator service listening as {SERVICE_NAME}");

    Ok(conn)
}
