//! # Gate packets
//!
//! Every message between a guest program and the host services travels as a
//! packet. A packet is a little-endian byte buffer with an 8-byte header:
//!
//! | offset | size | field                                       |
//! |--------|------|---------------------------------------------|
//! | 0      | 4    | total packet size including the header      |
//! | 4      | 2    | service code (signed, `-1` means services)  |
//! | 6      | 1    | domain in the low four bits, rest reserved  |
//! | 7      | 1    | index, echoed back in call replies          |
//!
//! The domain decides how the content is read:
//!
//! - **Call** and **Info** carry a service-defined payload.
//! - **Flow** carries `(stream id, value)` pairs. A positive value grants
//!   that many bytes of receive credit, zero closes the receiving side.
//! - **Data** carries a stream id, a note and bytes. Zero bytes means EOF.
//!
//! Packets are padded to an 8-byte boundary on the wire. The padding is
//! never part of the size field.
//!
//! ## Modules
//!
//! - [`buf`]: the [`Buf`] type with constructors, accessors and `cut`
//! - [`code`]: [`Code`] and [`Domain`]
//! - [`services`]: discovery request and response encoding
//! - [`validate`]: checks applied to everything a guest sends
//! - [`config`]: [`ServiceConfig`], handed to each service instance
//! - [`error`]: the [`Error`] type shared by all Gate crates

pub mod buf;
pub mod code;
pub mod config;
pub mod error;
pub mod services;
pub mod validate;

pub use buf::{
    align, Buf, Flow, ALIGNMENT, DATA_HEADER_SIZE, FLOW_ENTRY_SIZE, FLOW_HEADER_SIZE,
    HEADER_SIZE, MAX_PACKET_SIZE,
};
pub use code::{Code, Domain};
pub use config::ServiceConfig;
pub use error::{Error, ErrorKind, Result};
pub use services::{ServiceState, MAX_SERVICES};
pub use validate::{validate, validate_outbound};
