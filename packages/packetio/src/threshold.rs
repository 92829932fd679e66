//! Monotonic counter with change notification.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use gate_packet::{Error, Result};
use tokio::sync::Notify;

/// A wrapping `u32` that only moves forward, plus a wakeup for one waiter.
///
/// Producers call [`Threshold::increase`] or [`Threshold::advance`]; the
/// consumer awaits [`Threshold::changed`]. Once [`Threshold::finish`] has been
/// called the consumer stops waiting. Notifications are never lost: a change
/// made while nobody waits is remembered until the next wait.
#[derive(Debug, Default)]
pub struct Threshold {
    value: AtomicU32,
    notify: Notify,
    finished: AtomicBool,
}

impl Threshold {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            ..Self::default()
        }
    }

    /// Add a guest-supplied increment. Negative increments are rejected.
    pub fn increase(&self, increment: i32) -> Result<()> {
        if increment < 0 {
            return Err(Error::bad_program(format!(
                "negative flow increment {increment}"
            )));
        }
        self.advance(increment as u32);
        Ok(())
    }

    /// Add a host-side amount.
    pub fn advance(&self, amount: u32) {
        self.value.fetch_add(amount, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Wake the waiter without changing the value.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn current(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    /// Wait for the next change. Returns false once finished.
    pub async fn changed(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.notify.notified().await;
        !self.is_finished()
    }
}
