//! Host-to-guest half of a stream.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use gate_packet::{Buf, Error, Result, ServiceConfig, DATA_HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lock;
use crate::state::ReadState;
use crate::threshold::Threshold;

/// Leftover buffer space smaller than this is not worth reading into.
const MIN_READ_SIZE: usize = 1536;

#[derive(Debug)]
struct Progress {
    reading: bool,
    sending: bool,
    read: u32,
    pending: Option<Buf>,
}

/// Moves bytes from a host reader to the guest as Data packets.
///
/// The guest subscribes with positive Flow values. Bytes are read from the
/// host only while credit is outstanding, so nothing is ever read that could
/// not be delivered. When the host reader ends, or the guest stops
/// subscribing and the credit runs out, one empty Data packet marks EOF.
#[derive(Debug)]
pub struct ReadHalf {
    credit: Threshold,
    delivered: AtomicU32,
    subscribing: AtomicBool,
    progress: Mutex<Progress>,
}

impl Default for ReadHalf {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadHalf {
    pub fn new() -> Self {
        Self::restore(&ReadState::default(), true, 0)
    }

    pub(crate) fn restore(state: &ReadState, sending: bool, id: i32) -> Self {
        let pending = state.pending.clone().map(|mut p| {
            p.set_data_id(id);
            p.clear_size();
            p
        });
        Self {
            credit: Threshold::with_value(state.subscribed),
            delivered: AtomicU32::new(0),
            subscribing: AtomicBool::new(state.subscribing),
            progress: Mutex::new(Progress {
                reading: state.reading,
                sending,
                read: 0,
                pending,
            }),
        }
    }

    /// Add guest credit.
    pub fn subscribe(&self, increment: i32) -> Result<()> {
        if !self.subscribing.load(Ordering::Acquire) {
            return Err(Error::bad_program("stream subscription after EOF"));
        }
        let outstanding = self
            .credit
            .current()
            .wrapping_sub(self.delivered.load(Ordering::Acquire));
        if i64::from(outstanding) + i64::from(increment) > i64::from(i32::MAX) {
            return Err(Error::bad_program("stream subscription overflow"));
        }
        self.credit.increase(increment)
    }

    /// The guest will grant no more credit.
    pub fn finish_subscription(&self) -> Result<()> {
        if !self.subscribing.swap(false, Ordering::AcqRel) {
            return Err(Error::bad_program("duplicate stream subscription EOF"));
        }
        self.credit.poke();
        Ok(())
    }

    pub fn is_subscribing(&self) -> bool {
        self.subscribing.load(Ordering::Acquire)
    }

    pub(crate) fn is_live(&self) -> bool {
        let p = lock(&self.progress);
        p.sending || p.pending.is_some() || self.is_subscribing()
    }

    /// Returns the stream-level sending flag alongside the half's state.
    pub(crate) fn snapshot(&self) -> (bool, ReadState) {
        let p = lock(&self.progress);
        let state = ReadState {
            reading: p.reading,
            subscribing: self.is_subscribing(),
            subscribed: self.credit.current().wrapping_sub(p.read),
            pending: p.pending.clone(),
        };
        (p.sending, state)
    }

    /// Pump bytes until the half is finished, stopped or cancelled.
    ///
    /// A read error ends reading like EOF does and is returned afterwards.
    pub(crate) async fn transfer<R>(
        &self,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        config: &ServiceConfig,
        id: i32,
        send: &mpsc::Sender<Buf>,
        reader: Option<R>,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let (mut reader, mut sending, mut readpos, mut pending) = {
            let mut p = lock(&self.progress);
            let reader = if p.reading { reader } else { None };
            (reader, p.sending, p.read, p.pending.take())
        };
        let max_data = config
            .max_send_size
            .saturating_sub(DATA_HEADER_SIZE)
            .max(1);
        let mut spare: Option<Buf> = None;
        let mut failure = None;

        loop {
            let subscribing = self.is_subscribing();
            if !sending && !subscribing {
                break;
            }
            let window = self.credit.current().wrapping_sub(readpos);
            if window == 0 && !subscribing {
                // Nothing more can be delivered: acknowledge with EOF.
                reader = None;
            }
            if sending && pending.is_none() && reader.is_none() {
                pending = Some(Buf::make_data_eof(config.code, id));
            }

            if pending.is_some() || reader.is_none() || window == 0 {
                let proceed = tokio::select! {
                    biased;
                    _ = stop.cancelled() => false,
                    _ = ctx.cancelled() => false,
                    permit = send.reserve(), if pending.is_some() => match permit {
                        Ok(permit) => {
                            if let Some(p) = pending.take() {
                                if p.data_len() == 0 {
                                    sending = false;
                                }
                                permit.send(p);
                            }
                            true
                        }
                        Err(_) => false,
                    },
                    _ = self.credit.changed() => true,
                };
                if !proceed {
                    break;
                }
                continue;
            }

            let Some(r) = reader.as_mut() else {
                continue;
            };
            let mut p = match spare.take() {
                Some(b) if b.data_len() >= (window as usize).min(MIN_READ_SIZE) => b,
                _ => Buf::make_data(config.code, id, max_data),
            };
            let limit = (window as usize).min(max_data).min(p.data_len());

            let result = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                _ = ctx.cancelled() => None,
                res = r.read(&mut p.data_mut()[..limit]) => Some(res),
            };
            match result {
                None => break,
                Some(Ok(0)) => reader = None,
                Some(Ok(n)) => {
                    readpos = readpos.wrapping_add(n as u32);
                    self.delivered.store(readpos, Ordering::Release);
                    let (packet, tail) = p.cut_data(n);
                    spare = tail;
                    pending = Some(packet);
                }
                Some(Err(e)) => {
                    tracing::debug!(stream = id, error = %e, "stream read failed");
                    reader = None;
                    failure = Some(e);
                }
            }
        }

        let mut p = lock(&self.progress);
        p.reading = reader.is_some();
        p.sending = sending;
        p.read = readpos;
        // An EOF packet is rebuilt on demand; only data needs keeping.
        p.pending = pending.filter(|p| p.data_len() > 0);
        drop(p);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_after_eof_is_bad_program() {
        let half = ReadHalf::new();
        half.subscribe(5).unwrap();
        half.finish_subscription().unwrap();
        assert!(half.subscribe(1).unwrap_err().is_bad_program());
        assert!(half.finish_subscription().unwrap_err().is_bad_program());
    }

    #[test]
    fn subscription_cannot_overflow() {
        let half = ReadHalf::new();
        half.subscribe(i32::MAX).unwrap();
        assert!(half.subscribe(1).is_err());
    }

    #[test]
    fn negative_subscription_is_bad_program() {
        let half = ReadHalf::new();
        assert!(half.subscribe(-3).unwrap_err().is_bad_program());
    }

    #[test]
    fn snapshot_reports_outstanding_credit() {
        let half = ReadHalf::new();
        half.subscribe(3).unwrap();
        half.subscribe(4).unwrap();
        let (sending, state) = half.snapshot();
        assert!(sending);
        assert_eq!(state.subscribed, 7);
        assert!(state.subscribing);
        assert!(state.reading);
    }
}
