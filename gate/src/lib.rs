//! Gate: a runtime for sandboxed programs that reach the host only through
//! packets.
//!
//! Programs talk to host services over a single pipe. Each packet names a
//! service by its code; the host multiplexes those codes onto service
//! instances, tracks byte streams with credit-based flow control, and can
//! suspend a program together with its services and resume it later.
//!
//! - [`packet`]: the packet format and its validation.
//! - [`packetio`]: flow-controlled streams over packets.
//! - [`service`]: the service traits, registry, multiplexer and built-in services.
//! - [`runtime`]: instances, modules, snapshots and the runtime itself.

pub use gate_packet as packet;
pub use gate_packetio as packetio;
pub use gate_runtime as runtime;
pub use gate_service as service;
