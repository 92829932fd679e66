//! Ring buffer between a guest producer and a host consumer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use gate_packet::{Error, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::lock;
use crate::threshold::Threshold;

const MAX_BUFFER_SIZE: usize = 1 << 30;

/// Round a configured size up to a usable ring capacity.
pub fn buffer_size(size: usize) -> usize {
    size.clamp(1, MAX_BUFFER_SIZE).next_power_of_two()
}

/// Fixed-capacity byte ring with unwrapped `u32` positions.
///
/// `produced` and `consumed` count bytes since the ring was created and wrap
/// modulo 2^32; the capacity is a power of two, so a position maps to a slot
/// by masking. The occupied length is `produced - consumed`.
#[derive(Debug)]
pub struct RingBuffer {
    data: Mutex<Box<[u8]>>,
    produced: Threshold,
    consumed: Threshold,
    eof: AtomicBool,
}

impl RingBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; buffer_size(size)].into_boxed_slice()),
            produced: Threshold::new(),
            consumed: Threshold::new(),
            eof: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn produced(&self) -> u32 {
        self.produced.current()
    }

    pub fn consumed(&self) -> u32 {
        self.consumed.current()
    }

    pub fn len(&self) -> usize {
        self.produced().wrapping_sub(self.consumed()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes. Fails if they don't fit in the free space.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        {
            let mut data = lock(&self.data);
            let used = self.len();
            if used + bytes.len() > data.len() {
                return Err(Error::bad_program(format!(
                    "stream buffer overflow: {} bytes written into {} free",
                    bytes.len(),
                    data.len() - used
                )));
            }
            let mask = data.len() - 1;
            let off = self.produced() as usize & mask;
            let first = bytes.len().min(data.len() - off);
            data[off..off + first].copy_from_slice(&bytes[..first]);
            data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
        self.produced.advance(bytes.len() as u32);
        Ok(bytes.len())
    }

    /// Remember that the producer reached its end.
    pub fn write_eof(&self) {
        self.eof.store(true, Ordering::Release);
    }

    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    /// No more bytes will be produced.
    pub fn finish(&self) {
        self.produced.finish();
    }

    pub fn is_finished(&self) -> bool {
        self.produced.is_finished()
    }

    /// No more bytes will be consumed.
    pub fn finish_consuming(&self) {
        self.consumed.finish();
    }

    pub async fn produced_changed(&self) -> bool {
        self.produced.changed().await
    }

    pub async fn consumed_changed(&self) -> bool {
        self.consumed.changed().await
    }

    /// Write bytes between two positions to `sink` and mark them consumed.
    ///
    /// At most the contiguous run starting at `begin` is written, and the
    /// sink may accept less; the return value is what was consumed.
    pub async fn write_to<W>(&self, sink: &mut W, begin: u32, end: u32) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let len = end.wrapping_sub(begin) as usize;
        if len == 0 {
            return Ok(0);
        }
        let chunk = {
            let data = lock(&self.data);
            let off = begin as usize & (data.len() - 1);
            let n = len.min(data.len() - off);
            data[off..off + n].to_vec()
        };
        let n = sink.write(&chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.consumed.advance(n as u32);
        Ok(n)
    }

    /// Copy out the bytes between two positions, as up to two runs, plus the
    /// EOF flag.
    pub fn extract(&self, begin: u32, end: u32) -> (Vec<u8>, Vec<u8>, bool) {
        let len = end.wrapping_sub(begin) as usize;
        let data = lock(&self.data);
        let len = len.min(data.len());
        let off = begin as usize & (data.len() - 1);
        let first = len.min(data.len() - off);
        (
            data[off..off + first].to_vec(),
            data[..len - first].to_vec(),
            self.eof(),
        )
    }
}
