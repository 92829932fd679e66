//! Bidirectional streams.

use std::io;

use gate_packet::{Buf, Error, Result, ServiceConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::read::ReadHalf;
use crate::state::StreamState;
use crate::write::WriteHalf;

/// A stream between a guest and a host endpoint.
///
/// The service that owns the stream forwards guest Flow values to
/// [`Stream::handle_flow`] and guest Data payloads to
/// [`Stream::handle_data`]; the host side runs [`Stream::transfer`].
#[derive(Debug)]
pub struct Stream {
    id: i32,
    read: ReadHalf,
    write: WriteHalf,
    stop: CancellationToken,
}

impl Stream {
    pub fn new(id: i32, buffer_size: usize) -> Self {
        Self {
            id,
            read: ReadHalf::new(),
            write: WriteHalf::new(buffer_size),
            stop: CancellationToken::new(),
        }
    }

    /// Recreate a suspended stream.
    pub fn restore(id: i32, state: &StreamState, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            id,
            read: ReadHalf::restore(&state.read, state.sending, id),
            write: WriteHalf::restore(&state.write, buffer_size)?,
            stop: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn read_half(&self) -> &ReadHalf {
        &self.read
    }

    pub fn write_half(&self) -> &WriteHalf {
        &self.write
    }

    /// Apply a guest Flow value: credit if positive, end of credit if zero.
    pub fn handle_flow(&self, value: i32) -> Result<()> {
        match value {
            v if v > 0 => self.read.subscribe(v),
            0 => self.read.finish_subscription(),
            v => Err(Error::bad_program(format!(
                "flow note {v} on stream {}",
                self.id
            ))),
        }
    }

    /// Apply a guest Data payload: bytes, or EOF if empty.
    pub fn handle_data(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.write.close()
        } else {
            self.write.write(data)
        }
    }

    /// Run both directions until they finish, or until the stream is stopped
    /// or `ctx` is cancelled.
    ///
    /// A missing reader or writer counts as already closed. A stopped or
    /// cancelled transfer keeps its state for [`Stream::snapshot`] and
    /// returns without error. Otherwise a read error is reported in
    /// preference to a write error.
    pub async fn transfer<R, W>(
        &self,
        ctx: &CancellationToken,
        config: &ServiceConfig,
        reader: Option<R>,
        writer: Option<W>,
        send: &mpsc::Sender<Buf>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (read, write) = tokio::join!(
            self.read
                .transfer(ctx, &self.stop, config, self.id, send, reader),
            self.write
                .transfer(ctx, &self.stop, config, self.id, send, writer),
        );
        read.and(write)
    }

    /// Interrupt a running transfer.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Whether anything remains to be done in either direction.
    pub fn is_live(&self) -> bool {
        self.read.is_live() || self.write.is_live()
    }

    pub fn snapshot(&self) -> StreamState {
        let (sending, read) = self.read.snapshot();
        StreamState {
            sending,
            read,
            write: self.write.snapshot(),
        }
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        self.snapshot().marshal(out);
    }
}
