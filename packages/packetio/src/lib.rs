//! # Packet streams
//!
//! Byte streams between a guest and a host endpoint, carried inside Flow and
//! Data packets of one service. Each direction is credit based: the receiver
//! grants byte credit with Flow packets, and the sender never sends more
//! than it was granted.
//!
//! A [`Stream`] couples two halves:
//!
//! - [`ReadHalf`] moves bytes from a host reader to the guest. The guest
//!   subscribes with Flow packets; the half answers with Data packets.
//! - [`WriteHalf`] moves bytes from the guest to a host writer through a
//!   [`RingBuffer`]. The half grants credit as the ring drains.
//!
//! Streams survive suspension. [`Stream::snapshot`] captures everything that
//! is needed to continue, and [`StreamState::marshal`] turns that into bytes
//! with the [`varint`] encoding.

mod buffer;
mod read;
mod state;
mod stream;
mod threshold;
pub mod varint;
mod write;

pub use buffer::{buffer_size, RingBuffer};
pub use read::ReadHalf;
pub use state::{ReadState, StreamState, WriteState};
pub use stream::Stream;
pub use threshold::Threshold;
pub use write::WriteHalf;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
