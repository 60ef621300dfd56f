// SPDX-License-Identifier: MIT OR Apache-2.0

//! Access mediation core: hooks route security-sensitive operations through
//! a user-space decision agent, stalling the originating task until a
//! verdict arrives or a bounded timeout fires.

pub mod cache;
pub mod config;
pub mod event;
pub mod factory;
pub mod hooks;
pub mod mediator;
pub mod self_set;
pub mod server;
pub mod stall_tbl;
pub mod stats;
pub mod wait;
pub mod wire;

#[cfg(test)]
mod tests;

pub use config::{ConfigSnapshot, ControlRequest};
pub use event::{
    AttrChange, CredIds, DirInfo, Event, EventKind, FileInfo, Response, TaskInfo, Verdict,
};
pub use hooks::CloneOrigin;
pub use mediator::{Mediator, MediatorOptions};
pub use stall_tbl::{Priority, TableError};
