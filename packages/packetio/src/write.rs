//! Guest-to-host half of a stream.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use gate_packet::{Buf, Error, Result, ServiceConfig};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::RingBuffer;
use crate::state::WriteState;

/// How the drain side of a transfer ended.
enum DrainEnd {
    Stopped,
    /// Guest EOF reached the host writer.
    Drained,
    /// The host writer is gone, possibly with an error.
    SinkClosed(Option<io::Error>),
}

struct FinishConsuming<'a>(&'a RingBuffer);

impl Drop for FinishConsuming<'_> {
    fn drop(&mut self) {
        self.0.finish_consuming();
    }
}

/// Moves bytes from the guest to a host writer.
///
/// Guest Data packets land in a ring buffer. A drain task copies the ring to
/// the host writer, and a credit task grants the guest more Flow credit as
/// space frees up, keeping the total grant at most one ring's worth ahead of
/// what has been consumed.
#[derive(Debug)]
pub struct WriteHalf {
    ring: RingBuffer,
    receiving: AtomicBool,
    sink_open: AtomicBool,
    eof_owed: AtomicBool,
    /// Ring position up to which the guest has been granted credit.
    subscribed: AtomicU32,
}

impl WriteHalf {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            ring: RingBuffer::new(buffer_size),
            receiving: AtomicBool::new(true),
            sink_open: AtomicBool::new(true),
            eof_owed: AtomicBool::new(false),
            subscribed: AtomicU32::new(0),
        }
    }

    pub(crate) fn restore(state: &WriteState, buffer_size: usize) -> Result<Self> {
        let half = Self::new(buffer_size);
        half.ring.write(&state.buffer).map_err(|e| {
            Error::internal("snapshot is invalid", format!("stream write buffer: {e}"))
        })?;
        let subscribed = state.subscribed.max(state.buffer.len() as u32);
        half.subscribed.store(subscribed, Ordering::Release);
        half.sink_open.store(state.writing, Ordering::Release);
        if !state.receiving {
            half.receiving.store(false, Ordering::Release);
            half.ring.write_eof();
            half.ring.finish();
        }
        Ok(half)
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Accept guest bytes within the granted credit.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if !self.receiving.load(Ordering::Acquire) {
            return Err(Error::bad_program("stream data after EOF"));
        }
        let available = self
            .subscribed
            .load(Ordering::Acquire)
            .wrapping_sub(self.ring.produced());
        if data.len() as u64 > u64::from(available) {
            return Err(Error::bad_program(format!(
                "stream data of {} bytes exceeds credit of {available}",
                data.len()
            )));
        }
        if !self.sink_open.load(Ordering::Acquire) {
            return Ok(());
        }
        self.ring.write(data).map(|_| ())
    }

    /// Guest EOF.
    pub fn close(&self) -> Result<()> {
        if !self.receiving.swap(false, Ordering::AcqRel) {
            return Err(Error::bad_program("duplicate stream data EOF"));
        }
        self.ring.write_eof();
        self.ring.finish();
        Ok(())
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    fn is_writing(&self) -> bool {
        self.sink_open.load(Ordering::Acquire) || self.eof_owed.load(Ordering::Acquire)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.is_receiving() || self.is_writing() || !self.ring.is_empty()
    }

    pub(crate) fn snapshot(&self) -> WriteState {
        let consumed = self.ring.consumed();
        let (first, second, _) = self.ring.extract(consumed, self.ring.produced());
        let receiving = self.is_receiving();
        let subscribed = if receiving {
            self.subscribed.load(Ordering::Acquire).wrapping_sub(consumed)
        } else {
            0
        };
        WriteState {
            writing: self.is_writing(),
            receiving,
            subscribed,
            buffer: [first, second].concat(),
        }
    }

    pub(crate) async fn transfer<W>(
        &self,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        config: &ServiceConfig,
        id: i32,
        send: &mpsc::Sender<Buf>,
        writer: Option<W>,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let writer = writer.filter(|_| self.sink_open.load(Ordering::Acquire));
        let end = match writer {
            Some(writer) => {
                let (end, ()) = tokio::join!(
                    self.drain(ctx, stop, writer),
                    self.grant(ctx, stop, config, id, send),
                );
                end
            }
            None => {
                self.ring.finish_consuming();
                DrainEnd::SinkClosed(None)
            }
        };

        match end {
            DrainEnd::Stopped => Ok(()),
            DrainEnd::Drained => {
                self.sink_open.store(false, Ordering::Release);
                Ok(())
            }
            DrainEnd::SinkClosed(err) => {
                self.sink_open.store(false, Ordering::Release);
                if self.is_receiving() {
                    self.eof_owed.store(true, Ordering::Release);
                }
                if self.eof_owed.load(Ordering::Acquire) {
                    let sent = tokio::select! {
                        biased;
                        _ = stop.cancelled() => false,
                        _ = ctx.cancelled() => false,
                        permit = send.reserve() => match permit {
                            Ok(permit) => {
                                permit.send(Buf::make_flow_eof(config.code, id));
                                true
                            }
                            Err(_) => false,
                        },
                    };
                    if sent {
                        self.eof_owed.store(false, Ordering::Release);
                    }
                }
                match err {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    async fn drain<W>(
        &self,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        mut writer: W,
    ) -> DrainEnd
    where
        W: AsyncWrite + Unpin,
    {
        let _finish = FinishConsuming(&self.ring);

        loop {
            let finished = self.ring.is_finished();
            let begin = self.ring.consumed();
            let end = self.ring.produced();

            if begin == end {
                if finished {
                    let result = tokio::select! {
                        biased;
                        _ = stop.cancelled() => None,
                        res = writer.shutdown() => Some(res),
                    };
                    return match result {
                        None => DrainEnd::Stopped,
                        Some(Ok(())) => DrainEnd::Drained,
                        Some(Err(e)) => DrainEnd::SinkClosed(Some(e)),
                    };
                }
                let woke = tokio::select! {
                    biased;
                    _ = stop.cancelled() => false,
                    _ = ctx.cancelled() => false,
                    _ = self.ring.produced_changed() => true,
                };
                if !woke {
                    return DrainEnd::Stopped;
                }
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                _ = ctx.cancelled() => None,
                res = self.ring.write_to(&mut writer, begin, end) => Some(res),
            };
            match result {
                None => return DrainEnd::Stopped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "stream write failed");
                    return DrainEnd::SinkClosed(Some(e));
                }
            }
        }
    }

    async fn grant(
        &self,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        config: &ServiceConfig,
        id: i32,
        send: &mpsc::Sender<Buf>,
    ) {
        let capacity = self.ring.capacity() as u32;
        loop {
            let target = self.ring.consumed().wrapping_add(capacity);
            let owed = target.wrapping_sub(self.subscribed.load(Ordering::Acquire));
            let wanted = owed != 0
                && owed <= capacity
                && self.is_receiving()
                && self.sink_open.load(Ordering::Acquire);

            let proceed = tokio::select! {
                biased;
                _ = stop.cancelled() => false,
                _ = ctx.cancelled() => false,
                alive = self.ring.consumed_changed() => alive,
                permit = send.reserve(), if wanted => match permit {
                    Ok(permit) => {
                        self.subscribed.fetch_add(owed, Ordering::AcqRel);
                        permit.send(Buf::make_flow(config.code, id, owed as i32));
                        true
                    }
                    Err(_) => false,
                },
            };
            if !proceed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_without_credit_is_bad_program() {
        let half = WriteHalf::new(8);
        assert!(half.write(b"x").unwrap_err().is_bad_program());
    }

    #[test]
    fn empty_write_needs_no_credit() {
        let half = WriteHalf::new(8);
        half.write(b"").unwrap();
    }

    #[test]
    fn data_after_eof_is_bad_program() {
        let half = WriteHalf::new(8);
        half.close().unwrap();
        assert!(half.write(b"x").unwrap_err().is_bad_program());
        assert!(half.close().unwrap_err().is_bad_program());
    }

    #[test]
    fn restored_credit_allows_writes() {
        let state = WriteState {
            subscribed: 6,
            buffer: b"ab".to_vec(),
            ..WriteState::default()
        };
        let half = WriteHalf::restore(&state, 8).unwrap();
        half.write(b"cdef").unwrap();
        assert!(half.write(b"g").is_err());

        let snapshot = half.snapshot();
        assert_eq!(snapshot.buffer, b"abcdef");
        assert_eq!(snapshot.subscribed, 6);
        assert!(snapshot.receiving);
    }

    #[test]
    fn snapshot_after_eof_has_no_credit() {
        let state = WriteState {
            subscribed: 4,
            ..WriteState::default()
        };
        let half = WriteHalf::restore(&state, 8).unwrap();
        half.write(b"hi").unwrap();
        half.close().unwrap();
        let snapshot = half.snapshot();
        assert!(!snapshot.receiving);
        assert_eq!(snapshot.subscribed, 0);
        assert_eq!(snapshot.buffer, b"hi");
    }
}
