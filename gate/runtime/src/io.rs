//! Packet framing on the guest pipe and the two pumps that move packets
//! between the pipe and the instance.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use gate_packet::{
    align, validate, validate_outbound, Buf, Code, Error, Result, HEADER_SIZE, MAX_PACKET_SIZE,
};
use gate_service::{Abort, Server};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sandbox::{GuestReader, GuestWriter};

/// Read one packet. Returns `None` if the pipe ends between packets.
pub async fn read_packet<R>(r: &mut R) -> Result<Option<Buf>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = r.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::bad_program("truncated packet header"));
        }
        filled += n;
    }

    let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(Error::bad_program(format!("invalid packet size {size}")));
    }

    let mut buf = vec![0u8; align(size)];
    buf[..HEADER_SIZE].copy_from_slice(&header);
    r.read_exact(&mut buf[HEADER_SIZE..])
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::bad_program("truncated packet"),
            _ => Error::from(e),
        })?;
    buf.truncate(size);
    Ok(Some(Buf::from(buf)))
}

/// Write one finalized packet followed by its padding.
pub async fn write_packet<W>(w: &mut W, p: &Buf) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    const PADDING: [u8; 8] = [0; 8];
    w.write_all(p.as_bytes()).await?;
    w.write_all(&PADDING[..p.padded_len() - p.len()]).await?;
    w.flush().await
}

/// Send unless `ctx` is cancelled first. Returns false if not sent.
async fn send<T>(ctx: &CancellationToken, tx: &mpsc::Sender<T>, value: T) -> bool {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => false,
        res = tx.send(value) => res.is_ok(),
    }
}

/// Move packets from the guest to the inbound queue.
///
/// Discovery requests are answered here so that the reply goes out ahead of
/// anything the guest sends afterwards. Ends when the guest closes the pipe,
/// which drops the inbound sender, or after queueing an error.
pub(crate) async fn read_pump(
    ctx: CancellationToken,
    mut reader: GuestReader,
    server: Arc<Server>,
    outbound: mpsc::Sender<Buf>,
    inbound: mpsc::Sender<Result<Buf>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => return,
            res = read_packet(&mut reader) => res,
        };
        let p = match next.and_then(|p| match p {
            Some(p) => validate(&p).map(|_| Some(p)),
            None => Ok(None),
        }) {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                send(&ctx, &inbound, Err(e)).await;
                return;
            }
        };

        if p.code() == Code::SERVICES {
            match server.handle_services_packet(&ctx, &p).await {
                Ok(reply) => {
                    if !send(&ctx, &outbound, reply).await {
                        return;
                    }
                }
                Err(e) => {
                    send(&ctx, &inbound, Err(e)).await;
                    return;
                }
            }
        } else if !send(&ctx, &inbound, Ok(p)).await {
            return;
        }
    }
}

/// Move packets from the outbound queue to the guest.
///
/// `initial` packets go first. Runs until `halt` is cancelled or the guest
/// stops reading; returns what was not written, with the queue itself, so
/// that undelivered packets can be kept in a snapshot. Once `drain` is
/// cancelled, only packets already queued are written. An invalid packet
/// from a service aborts the instance.
pub(crate) async fn write_pump(
    halt: CancellationToken,
    drain: CancellationToken,
    mut writer: GuestWriter,
    mut initial: VecDeque<Buf>,
    mut outbound: mpsc::Receiver<Buf>,
    abort: Abort,
) -> (VecDeque<Buf>, mpsc::Receiver<Buf>) {
    let mut draining = false;
    loop {
        let mut p = match initial.pop_front() {
            Some(p) => p,
            None if draining => match outbound.try_recv() {
                Ok(p) => p,
                Err(_) => break,
            },
            None => {
                let next = tokio::select! {
                    biased;
                    _ = halt.cancelled() => None,
                    _ = drain.cancelled() => {
                        draining = true;
                        continue;
                    }
                    p = outbound.recv() => p,
                };
                match next {
                    Some(p) => p,
                    None => break,
                }
            }
        };

        p.finalize();
        if let Err(e) = validate_outbound(&p) {
            tracing::error!(packet = %p, error = %e, "service sent an invalid packet");
            abort.abort(e);
            break;
        }

        let written = tokio::select! {
            biased;
            _ = halt.cancelled() => None,
            res = write_packet(&mut writer, &p) => Some(res),
        };
        match written {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::debug!(error = %e, "guest pipe closed for writing");
                initial.push_front(p);
                break;
            }
            None => {
                initial.push_front(p);
                break;
            }
        }
    }
    (initial, outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_packet::Domain;

    async fn frame(p: &Buf) -> Vec<u8> {
        let mut p = p.clone();
        p.finalize();
        let mut out = Vec::new();
        write_packet(&mut out, &p).await.unwrap();
        out
    }

    #[tokio::test]
    async fn framing_round_trip() {
        let mut p = Buf::make_call(Code::new(2), 3);
        p.content_mut().copy_from_slice(b"abc");
        let bytes = frame(&p).await;
        assert_eq!(bytes.len(), 16);

        let mut input = &bytes[..];
        let read = read_packet(&mut input).await.unwrap().unwrap();
        assert_eq!(read.len(), 11);
        assert_eq!(read.content(), b"abc");
        assert_eq!(read.domain(), Domain::CALL);
        assert!(read_packet(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncation_is_bad_program() {
        let bytes = frame(&Buf::make_call(Code::new(0), 10)).await;
        for cut in [3, 12] {
            let mut input = &bytes[..cut];
            let err = read_packet(&mut input).await.unwrap_err();
            assert!(err.is_bad_program(), "cut at {cut}: {err}");
        }
    }

    #[tokio::test]
    async fn oversized_packet_is_bad_program() {
        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_PACKET_SIZE as u32 + 8).to_le_bytes());
        header.extend_from_slice(&[0, 0, 0, 0]);
        let mut input = &header[..];
        assert!(read_packet(&mut input).await.unwrap_err().is_bad_program());
    }

    #[tokio::test]
    async fn write_pump_returns_unsent_packets() {
        let (guest, host) = tokio::io::duplex(1024);
        let (_, writer) = tokio::io::split(host);
        drop(guest);

        let (tx, rx) = mpsc::channel(4);
        let (abort, _abort_rx) = Abort::channel();
        tx.send(Buf::make_call(Code::new(0), 0)).await.unwrap();
        let initial = VecDeque::from([Buf::make_info(Code::SERVICES, 2)]);

        let (unsent, mut rx) = write_pump(
            CancellationToken::new(),
            CancellationToken::new(),
            Box::new(writer),
            initial,
            rx,
            abort,
        )
        .await;
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].code(), Code::SERVICES);
        assert_eq!(rx.recv().await.unwrap().code(), Code::new(0));
    }

    #[tokio::test]
    async fn write_pump_aborts_on_invalid_packet() {
        let (_guest, host) = tokio::io::duplex(1024);
        let (_, writer) = tokio::io::split(host);
        let (_tx, rx) = mpsc::channel(4);
        let (abort, abort_rx) = Abort::channel();
        let initial = VecDeque::from([Buf::make_flow(Code::new(0), -1, 1)]);

        let halt = CancellationToken::new();
        write_pump(halt.clone(), halt, Box::new(writer), initial, rx, abort).await;
        assert_eq!(abort_rx.await.unwrap().kind(), gate_packet::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn drain_writes_queued_packets_then_stops() {
        let (guest, host) = tokio::io::duplex(1024);
        let (_, writer) = tokio::io::split(host);
        let (mut guest_r, _guest_w) = tokio::io::split(guest);

        let (tx, rx) = mpsc::channel(4);
        let (abort, _abort_rx) = Abort::channel();
        tx.send(Buf::make_call(Code::new(0), 1)).await.unwrap();
        tx.send(Buf::make_call(Code::new(1), 2)).await.unwrap();

        let drain = CancellationToken::new();
        drain.cancel();
        let (unsent, _rx) = write_pump(
            CancellationToken::new(),
            drain,
            Box::new(writer),
            VecDeque::new(),
            rx,
            abort,
        )
        .await;
        assert!(unsent.is_empty());

        let first = read_packet(&mut guest_r).await.unwrap().unwrap();
        let second = read_packet(&mut guest_r).await.unwrap().unwrap();
        assert_eq!(first.code(), Code::new(0));
        assert_eq!(second.code(), Code::new(1));
        drop(tx);
    }
}
