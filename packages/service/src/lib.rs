//! # Gate services
//!
//! Services are host-side endpoints that a guest program reaches through
//! packets. This crate provides:
//!
//! - The [`Factory`] and [`Instance`] traits that every service implements.
//!   A factory describes a service and creates one [`Instance`] per program
//!   instance; the instance handles that program's packets.
//! - A [`Registry`] of factories, optionally layered on a parent registry.
//! - A [`Server`] that owns the service slots of one program instance:
//!   it answers discovery requests, creates service instances lazily, routes
//!   packets by code and collects snapshots at shutdown.
//! - Built-in services: [`origin`] for host-initiated byte streams,
//!   [`catalog`] for listing the registry and [`identity`] for ids.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gate_service::{origin::Connector, Registry};
//!
//! let connector = Arc::new(Connector::new(Default::default()));
//! let mut registry = Registry::new();
//! registry.register(connector.clone())?;
//!
//! // Once the guest has discovered "origin" and sent it a Call packet:
//! if let Some(conn) = connector.connect(&ctx).await {
//!     conn.transfer(&ctx, Some(reader), Some(writer)).await?;
//! }
//! ```

pub mod catalog;
pub mod identity;
pub mod origin;
mod registry;
mod server;
mod service;

pub use registry::{Registry, MAX_SERVICE_NAME_LEN};
pub use server::{Lifecycle, Server, ServerConfig, ServiceSnapshot};
pub use service::{Abort, Factory, Instance, InstanceConfig, PacketSender, Service};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
