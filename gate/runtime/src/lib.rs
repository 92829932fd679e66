//! # Gate runtime
//!
//! The runtime runs sandboxed guest programs and connects each of them to
//! host services over a single packet pipe.
//!
//! ## Core Concepts
//!
//! ### Instances
//!
//! An [`Instance`] is one run of a program module. The guest process lives in
//! a [`Sandbox`]; the runtime only sees both ends of its pipe and a
//! [`GuestControl`] handle. Packets from the guest are validated, then routed
//! by service code through a [`gate_service::Server`]. Anything a service
//! sends back is framed onto the pipe in the order it was queued.
//!
//! ### Suspension
//!
//! [`Runtime::suspend`] asks the guest to stop. Once the guest has closed its
//! pipe, every service is shut down with suspension and the results are
//! collected into an [`InstanceSnapshot`], together with packets that were
//! queued but never delivered. Launching with that snapshot resumes the
//! instance with the same service codes.
//!
//! ### Modules
//!
//! Programs are stored by content in a [`ModuleStorage`]. A module's id is
//! its SHA-384 digest, so uploading the same bytes twice yields one module.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────── Runtime ──────────────────────────────┐
//! │                                                                     │
//! │  ┌──────── Instance ────────┐      ┌──────── Instance ────────┐     │
//! │  │ guest ──▶ read pump ─┐   │      │                          │     │
//! │  │   ▲                  ▼   │      │           ...            │     │
//! │  │   │            serve loop│      │                          │     │
//! │  │   │                  │   │      └──────────────────────────┘     │
//! │  │ write pump ◀─ Server ◀┘  │                                       │
//! │  │              (services)  │                                       │
//! │  └──────────────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod instance;
pub mod io;
pub mod runtime;
pub mod sandbox;
pub mod snapshot;
pub mod storage;

pub use error::{Result, RuntimeError};
pub use instance::{Instance, InstanceId, InstanceState, Status};
pub use io::{read_packet, write_packet};
pub use runtime::{LaunchOptions, Runtime, RuntimeConfig};
pub use sandbox::{
    DebugSink, ExitInfo, Guest, GuestControl, GuestReader, GuestWriter, ProgramImage, Sandbox,
    TrapId,
};
pub use snapshot::InstanceSnapshot;
pub use storage::{MemoryStorage, ModuleId, ModuleReader, ModuleStorage};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
