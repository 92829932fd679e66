//! Origin service: streams between a guest and its host-side peers.
//!
//! The guest accepts a connection by sending a Call packet. Whenever an
//! accept is outstanding, the host may [`Connector::connect`]. The guest is
//! told the new stream's id in a Call reply with a 4-byte little-endian
//! body, after which the two sides exchange Flow and Data packets on that
//! id, and the host runs [`Conn::transfer`] with its reader and writer.
//!
//! One [`Connector`] serves one program instance.
//!
//! Suspension keeps the number of outstanding accepts and every stream that
//! still has work to do. Restored streams have no host peer: on start they
//! drain what is buffered for the guest and then finish.

mod instance;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gate_packet::{Buf, Error, Result, ServiceConfig};
use gate_packetio::{buffer_size, varint, Stream, StreamState};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::lock;
use crate::service::{Factory, Instance, InstanceConfig, PacketSender, Service};

use instance::OriginInstance;

pub const SERVICE_NAME: &str = "origin";
const SERVICE_REVISION: &str = "0";

/// Origin settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Streams that may be open at the same time.
    pub max_conns: usize,
    /// Guest-to-host ring size of each stream. Rounded up to a power of two.
    pub buffer_size: usize,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            max_conns: 3,
            buffer_size: 32768,
        }
    }
}

#[derive(Default)]
struct State {
    bound: bool,
    service: Option<ServiceConfig>,
    send: Option<PacketSender>,
    accepting: i32,
    replying: bool,
    shutting: bool,
    /// Conns and restored-stream drains still running.
    active: usize,
    streams: BTreeMap<i32, Arc<Stream>>,
}

impl State {
    fn free_id(&self) -> i32 {
        let mut id = 0;
        for &used in self.streams.keys() {
            if used != id {
                break;
            }
            id += 1;
        }
        id
    }
}

struct Shared {
    max_conns: usize,
    buffer_size: usize,
    state: Mutex<State>,
    wakeup: watch::Sender<()>,
    /// Cancelled when the instance starts shutting down.
    shutting: CancellationToken,
}

impl Shared {
    fn poke(&self) {
        self.wakeup.send_replace(());
    }

    /// Wait until `cond` holds. Returns false if `ctx` is cancelled first.
    async fn wait_until(&self, ctx: &CancellationToken, cond: impl Fn(&State) -> bool) -> bool {
        let mut wakeup = self.wakeup.subscribe();
        loop {
            if cond(&lock(&self.state)) {
                return true;
            }
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return false,
                changed = wakeup.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Forget a stream that has nothing left to do.
    fn release(&self, stream: &Stream) {
        let mut state = lock(&self.state);
        if !state.shutting && !stream.is_live() {
            state.streams.remove(&stream.id());
        }
        drop(state);
        self.poke();
    }
}

/// Counts a running stream user until dropped.
struct Active(Arc<Shared>);

impl Active {
    fn new(shared: &Arc<Shared>) -> Self {
        lock(&shared.state).active += 1;
        Active(shared.clone())
    }

    /// Like [`Active::new`], but not once shutdown has begun.
    fn enter(shared: &Arc<Shared>) -> Option<Self> {
        let mut state = lock(&shared.state);
        if state.shutting {
            return None;
        }
        state.active += 1;
        Some(Active(shared.clone()))
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        lock(&self.0.state).active -= 1;
        self.0.poke();
    }
}

/// Host-side handle of the origin service, and its factory.
pub struct Connector {
    shared: Arc<Shared>,
    closed: CancellationToken,
}

impl Connector {
    pub fn new(config: OriginConfig) -> Self {
        let (wakeup, _) = watch::channel(());
        Self {
            shared: Arc::new(Shared {
                max_conns: config.max_conns.max(1),
                buffer_size: buffer_size(config.buffer_size),
                state: Mutex::new(State::default()),
                wakeup,
                shutting: CancellationToken::new(),
            }),
            closed: CancellationToken::new(),
        }
    }

    /// Wait for the guest to accept, then open a stream to it.
    ///
    /// Returns `None` if `ctx` is cancelled, the connector is closed or the
    /// instance shuts down first. Holding the returned [`Conn`] without
    /// transferring does not hold up shutdown; its stream is kept as it was.
    pub async fn connect(&self, ctx: &CancellationToken) -> Option<Conn> {
        let shared = &self.shared;
        let mut wakeup = shared.wakeup.subscribe();

        let (id, stream, config, send) = loop {
            {
                let mut state = lock(&shared.state);
                if state.shutting || self.closed.is_cancelled() {
                    return None;
                }
                let ready = state.accepting > 0
                    && !state.replying
                    && state.streams.len() < shared.max_conns;
                if let (true, Some(config), Some(send)) =
                    (ready, state.service.clone(), state.send.clone())
                {
                    let id = state.free_id();
                    let stream = Arc::new(Stream::new(id, shared.buffer_size));
                    state.streams.insert(id, stream.clone());
                    state.accepting -= 1;
                    state.replying = true;
                    drop(state);
                    break (id, stream, config, send);
                }
            }
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return None,
                _ = self.closed.cancelled() => return None,
                changed = wakeup.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        };

        let mut reply = Buf::make_call(config.code, 4);
        reply.content_mut().copy_from_slice(&id.to_le_bytes());
        let sent = tokio::select! {
            biased;
            _ = ctx.cancelled() => false,
            _ = self.closed.cancelled() => false,
            _ = shared.shutting.cancelled() => false,
            permit = send.reserve() => match permit {
                Ok(permit) => {
                    permit.send(reply);
                    true
                }
                Err(_) => false,
            },
        };

        {
            let mut state = lock(&shared.state);
            state.replying = false;
            if !sent {
                state.streams.remove(&id);
                state.accepting = state.accepting.saturating_add(1);
            }
        }
        shared.poke();

        if !sent {
            return None;
        }
        tracing::debug!(stream = id, "origin connected");
        Some(Conn {
            shared: shared.clone(),
            stream,
            config,
            send,
        })
    }

    /// Refuse further connections.
    pub fn close(&self) {
        self.closed.cancel();
        self.shared.poke();
    }

    /// Outstanding guest accepts.
    pub fn accepting(&self) -> i32 {
        lock(&self.shared.state).accepting
    }

    pub fn num_streams(&self) -> usize {
        lock(&self.shared.state).streams.len()
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(OriginConfig::default())
    }
}

#[async_trait]
impl Factory for Connector {
    fn service(&self) -> Service {
        Service::new(SERVICE_NAME, SERVICE_REVISION).with_streams()
    }

    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        config: InstanceConfig,
        snapshot: Option<&[u8]>,
    ) -> Result<Arc<dyn Instance>> {
        let (accepting, streams) = match snapshot {
            Some(buf) => unmarshal(buf, &config.service, self.shared.buffer_size)?,
            None => (0, BTreeMap::new()),
        };

        let mut state = lock(&self.shared.state);
        if state.bound {
            return Err(Error::Conflict(
                "origin connector already serves an instance".into(),
            ));
        }
        state.bound = true;
        state.service = Some(config.service);
        state.accepting = accepting;
        let restored: Vec<Arc<Stream>> = streams.values().cloned().collect();
        state.streams = streams;
        drop(state);

        Ok(Arc::new(OriginInstance::new(self.shared.clone(), restored)))
    }
}

/// A connected stream, owned by the host.
///
/// Shutdown waits for running transfers only. A transfer started after
/// shutdown has begun returns at once and leaves the stream untouched.
pub struct Conn {
    shared: Arc<Shared>,
    stream: Arc<Stream>,
    config: ServiceConfig,
    send: PacketSender,
}

impl Conn {
    pub fn id(&self) -> i32 {
        self.stream.id()
    }

    /// Move bytes until both directions are done, the instance shuts down
    /// or `ctx` is cancelled.
    pub async fn transfer<R, W>(
        self,
        ctx: &CancellationToken,
        reader: Option<R>,
        writer: Option<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Some(_active) = Active::enter(&self.shared) else {
            return Ok(());
        };
        let result = self
            .stream
            .transfer(ctx, &self.config, reader, writer, &self.send)
            .await;
        self.shared.release(&self.stream);
        result.map_err(Error::from)
    }
}

/// Snapshot: varint accepting, varint stream count, then each stream as
/// varint id followed by its marshaled state.
fn marshal(accepting: i32, streams: &BTreeMap<i32, Arc<Stream>>) -> Vec<u8> {
    let mut out = Vec::new();
    varint::put(&mut out, accepting as u32);
    varint::put(&mut out, streams.len() as u32);
    for (&id, stream) in streams {
        varint::put(&mut out, id as u32);
        stream.marshal(&mut out);
    }
    out
}

fn unmarshal(
    mut input: &[u8],
    config: &ServiceConfig,
    buffer_size: usize,
) -> Result<(i32, BTreeMap<i32, Arc<Stream>>)> {
    let (accepting, rest) = varint::scan_i32(input)?;
    let (count, rest) = varint::scan(rest)?;
    input = rest;

    let mut streams = BTreeMap::new();
    for _ in 0..count {
        let (id, rest) = varint::scan_i32(input)?;
        let (state, rest) = StreamState::unmarshal(rest, config, buffer_size)?;
        input = rest;
        let stream = Stream::restore(id, &state, buffer_size)?;
        if streams.insert(id, Arc::new(stream)).is_some() {
            return Err(Error::internal(
                "snapshot is invalid",
                format!("origin stream {id} appears twice"),
            ));
        }
    }
    if !input.is_empty() {
        return Err(Error::internal(
            "snapshot is invalid",
            "trailing bytes after origin streams",
        ));
    }
    Ok((accepting, streams))
}
