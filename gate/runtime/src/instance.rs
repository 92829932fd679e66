//! Program instances.
//!
//! An [`Instance`] joins a sandboxed guest to a service [`Server`]. Two pumps
//! carry packets over the guest pipe; the serve loop hands each inbound
//! packet to the server and sends any reply back. Everything an instance
//! does is scoped by its own cancellation token, a child of the runtime's.
//!
//! ```text
//! Loaded ──start──▶ Started ──exit──────────────────────▶ Terminated
//!                      │                                     ▲
//!                      └──suspend──▶ Suspending ──drained────┘ (with snapshot)
//! Loaded/Started/Suspending ──kill──▶ Killed
//! any non-terminal ──error──▶ Failed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use gate_packet::services::make_services;
use gate_packet::{Buf, Code, Domain, Error, ErrorKind};
use gate_service::{Registry, Server, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::io::{read_pump, write_pump};
use crate::lock;
use crate::runtime::RuntimeConfig;
use crate::sandbox::{ExitInfo, Guest, GuestControl, GuestReader, GuestWriter, TrapId};
use crate::snapshot::InstanceSnapshot;

/// Unique identifier for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Loaded,
    Started,
    Suspending,
    Terminated,
    Killed,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceState::Terminated | InstanceState::Killed | InstanceState::Failed
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceState::Loaded => "loaded",
            InstanceState::Started => "started",
            InstanceState::Suspending => "suspending",
            InstanceState::Terminated => "terminated",
            InstanceState::Killed => "killed",
            InstanceState::Failed => "failed",
        })
    }
}

/// Where an instance is, and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<TrapId>,
    /// Exit code of a guest that exited normally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<i32>,
    /// Public message of the error that failed the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Status {
    pub fn new(state: InstanceState) -> Self {
        Self {
            state,
            cause: None,
            result: None,
            error: None,
        }
    }

    fn with_cause(state: InstanceState, cause: TrapId) -> Self {
        Self {
            cause: Some(cause),
            ..Self::new(state)
        }
    }

    fn exited(exit: ExitInfo) -> Self {
        match exit {
            ExitInfo::Exited(code) => Self {
                result: Some(code as i32),
                ..Self::new(InstanceState::Terminated)
            },
            ExitInfo::Trapped(trap) => Self::with_cause(InstanceState::Terminated, trap),
            ExitInfo::Signaled => Self::with_cause(InstanceState::Killed, TrapId::KILLED),
        }
    }

    fn failed(err: &Error) -> Self {
        let cause = if err.is_bad_program() {
            TrapId::ABI_VIOLATION
        } else {
            TrapId::INTERNAL_ERROR
        };
        Self {
            error: Some(err.public_message()),
            ..Self::with_cause(InstanceState::Failed, cause)
        }
    }
}

/// Why the serve loop stopped.
enum End {
    GuestClosed,
    Failed(Error),
    Cancelled,
}

/// Guest-facing parts that the serve loop takes over.
struct Pipes {
    reader: GuestReader,
    writer: GuestWriter,
    initial: VecDeque<Buf>,
    outbound: mpsc::Receiver<Buf>,
    abort: oneshot::Receiver<Error>,
    inbound_capacity: usize,
}

/// A guest program and its services.
pub struct Instance {
    id: InstanceId,
    ctx: CancellationToken,
    server: Arc<Server>,
    outbound: mpsc::Sender<Buf>,
    control: Arc<dyn GuestControl>,
    status: watch::Sender<Status>,
    snapshot: Mutex<Option<InstanceSnapshot>>,
    pipes: Mutex<Option<Pipes>>,
}

impl Instance {
    /// Set up services for a spawned guest, restoring them from `snapshot`.
    ///
    /// If the instance has services from the start, the guest's first packet
    /// is an Info packet on the services code with their states. Packets
    /// that were pending at suspension follow.
    pub async fn new(
        ctx: &CancellationToken,
        id: InstanceId,
        guest: Guest,
        registry: Arc<Registry>,
        config: &RuntimeConfig,
        snapshot: Option<InstanceSnapshot>,
        principal: Option<String>,
    ) -> Result<Self> {
        let Guest {
            reader,
            writer,
            control,
        } = guest;
        let ctx = ctx.child_token();
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let snapshot = snapshot.unwrap_or_default();
        let server_config = ServerConfig {
            max_send_size: config.max_send_size,
            instance: id.as_uuid(),
            principal,
        };

        let created = async {
            let pending = snapshot.pending_packets()?;
            let (server, states, abort) = Server::create(
                registry,
                &ctx,
                server_config,
                &snapshot.services,
                outbound.clone(),
            )
            .await?;
            Ok::<_, Error>((server, states, abort, pending))
        }
        .await;
        let (server, states, abort, pending) = match created {
            Ok(created) => created,
            Err(e) => {
                control.kill();
                return Err(e.into());
            }
        };

        let mut initial = VecDeque::new();
        if !states.is_empty() {
            initial.push_back(make_services(Domain::INFO, &states));
        }
        initial.extend(pending.into_iter().filter(|p| !is_services_info(p)));

        tracing::debug!(instance = %id, services = states.len(), "instance loaded");
        let (status, _) = watch::channel(Status::new(InstanceState::Loaded));
        Ok(Self {
            id,
            ctx,
            server: Arc::new(server),
            outbound,
            control,
            status,
            snapshot: Mutex::new(None),
            pipes: Mutex::new(Some(Pipes {
                reader,
                writer,
                initial,
                outbound: outbound_rx,
                abort,
                inbound_capacity: config.inbound_capacity,
            })),
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> InstanceState {
        self.status.borrow().state
    }

    fn transition(&self, from: InstanceState, to: InstanceState) -> bool {
        self.status.send_if_modified(|s| {
            if s.state == from {
                s.state = to;
                true
            } else {
                false
            }
        })
    }

    /// Record a terminal status unless one has been recorded already.
    fn finish(&self, status: Status) -> bool {
        self.status.send_if_modified(|s| {
            if s.state.is_terminal() {
                false
            } else {
                *s = status;
                true
            }
        })
    }

    fn log_failure(&self, err: &Error) {
        match err.kind() {
            ErrorKind::Cancelled => {}
            ErrorKind::BadProgram => {
                tracing::warn!(instance = %self.id, error = %err, "program violated the protocol")
            }
            _ => tracing::error!(instance = %self.id, error = %err, "instance failed"),
        }
    }

    /// Start every service.
    pub async fn start(&self) -> Result<()> {
        if !self.transition(InstanceState::Loaded, InstanceState::Started) {
            return Err(RuntimeError::InvalidState(format!(
                "cannot start {} instance",
                self.state()
            )));
        }
        if let Err(e) = self.server.start(&self.ctx).await {
            self.log_failure(&e);
            self.control.kill();
            self.finish(Status::failed(&e));
            self.ctx.cancel();
            return Err(e.into());
        }
        tracing::info!(instance = %self.id, "instance started");
        Ok(())
    }

    /// Start, then serve until the instance ends.
    pub async fn run(self: Arc<Self>) -> Status {
        if self.start().await.is_err() {
            self.release().await;
            return self.status();
        }
        self.serve().await
    }

    /// Drop the guest pipes and shut the services down without serving.
    pub(crate) async fn release(&self) {
        lock(&self.pipes).take();
        if let Err(e) = self.server.shutdown(&self.ctx, false).await {
            tracing::debug!(instance = %self.id, error = %e, "service shutdown failed");
        }
    }

    /// Move packets until the guest exits, an error occurs, the instance is
    /// killed or the runtime shuts down. Returns the final status.
    ///
    /// When a suspended guest exits, the services are shut down with
    /// suspension and the snapshot is kept for [`Instance::suspend`]. On
    /// cancellation, packets already queued are flushed before the guest is
    /// killed; a killed guest gets nothing more.
    pub async fn serve(&self) -> Status {
        let pipes = lock(&self.pipes).take();
        let Some(pipes) = pipes else {
            return self.wait().await;
        };
        let Pipes {
            reader,
            writer,
            initial,
            outbound,
            mut abort,
            inbound_capacity,
        } = pipes;

        let halt = CancellationToken::new();
        let drain = CancellationToken::new();
        let writer_gone = CancellationToken::new();
        let (inbound_tx, mut inbound) = mpsc::channel(inbound_capacity.max(1));
        let reader_task = tokio::spawn(read_pump(
            self.ctx.clone(),
            reader,
            self.server.clone(),
            self.outbound.clone(),
            inbound_tx,
        ));
        let writer_task = {
            let halt = halt.clone();
            let drain = drain.clone();
            let gone = writer_gone.clone();
            let abort = self.server.abort_handle();
            tokio::spawn(async move {
                let unsent = write_pump(halt, drain, writer, initial, outbound, abort).await;
                gone.cancel();
                unsent
            })
        };

        // Replies that found the writer gone.
        let mut late = Vec::new();
        let mut abort_open = true;
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break End::Cancelled,
                res = &mut abort, if abort_open => match res {
                    Ok(err) => break End::Failed(err),
                    Err(_) => {
                        abort_open = false;
                        continue;
                    }
                },
                p = inbound.recv() => p,
            };
            let p = match next {
                None => break End::GuestClosed,
                Some(Err(e)) => break End::Failed(e),
                Some(Ok(p)) => p,
            };

            match self.server.handle(&self.ctx, p).await {
                Ok(Some(reply)) => {
                    tokio::select! {
                        biased;
                        _ = self.ctx.cancelled() => break End::Cancelled,
                        _ = writer_gone.cancelled() => late.push(reply),
                        permit = self.outbound.reserve() => match permit {
                            Ok(permit) => permit.send(reply),
                            Err(_) => late.push(reply),
                        },
                    }
                }
                Ok(None) => {}
                Err(Error::Cancelled) => break End::Cancelled,
                Err(e) => break End::Failed(e),
            }
        };
        reader_task.abort();

        let status = match end {
            End::GuestClosed => {
                let exit = self.control.wait().await;
                let suspending = self.state() == InstanceState::Suspending
                    || exit == ExitInfo::Trapped(TrapId::SUSPENDED);
                halt.cancel();
                let (unsent, mut queue) = match writer_task.await {
                    Ok(unsent) => unsent,
                    Err(e) => {
                        let err = Error::internal("instance failed", e.to_string());
                        self.log_failure(&err);
                        self.finish(Status::failed(&err));
                        (VecDeque::new(), mpsc::channel(1).1)
                    }
                };

                if suspending {
                    match self.server.shutdown(&self.ctx, true).await {
                        Ok(services) => {
                            queue.close();
                            let mut packets: Vec<Buf> = unsent.into();
                            packets.extend(late);
                            while let Ok(p) = queue.try_recv() {
                                packets.push(p);
                            }
                            // Resumption announces the services afresh.
                            packets.retain(|p| !is_services_info(p));
                            for p in &mut packets {
                                p.finalize();
                            }
                            let mut snapshot = InstanceSnapshot {
                                services,
                                pending: Vec::new(),
                            };
                            snapshot.push_pending(&packets);
                            tracing::info!(
                                instance = %self.id,
                                pending = packets.len(),
                                "instance suspended"
                            );
                            *lock(&self.snapshot) = Some(snapshot);
                            Status::with_cause(InstanceState::Terminated, TrapId::SUSPENDED)
                        }
                        Err(e) => {
                            self.log_failure(&e);
                            Status::failed(&e)
                        }
                    }
                } else {
                    if let Err(e) = self.server.shutdown(&self.ctx, false).await {
                        self.log_failure(&e);
                    }
                    tracing::info!(instance = %self.id, exit = ?exit, "instance exited");
                    Status::exited(exit)
                }
            }
            End::Failed(e) => {
                self.log_failure(&e);
                self.control.kill();
                halt.cancel();
                let _ = writer_task.await;
                if let Err(e) = self.server.shutdown(&self.ctx, false).await {
                    tracing::debug!(instance = %self.id, error = %e, "service shutdown failed");
                }
                self.control.wait().await;
                Status::failed(&e)
            }
            End::Cancelled => {
                let mut writer_task = writer_task;
                let mut flushed = false;
                if self.state() != InstanceState::Killed {
                    // Flush what is queued unless the guest goes away first.
                    drain.cancel();
                    tokio::select! {
                        _ = &mut writer_task => flushed = true,
                        _ = self.control.wait() => {}
                    }
                }
                self.control.kill();
                halt.cancel();
                if !flushed {
                    let _ = writer_task.await;
                }
                if let Err(e) = self.server.shutdown(&self.ctx, false).await {
                    tracing::debug!(instance = %self.id, error = %e, "service shutdown failed");
                }
                self.control.wait().await;
                Status::new(InstanceState::Terminated)
            }
        };

        self.ctx.cancel();
        self.finish(status);
        self.status()
    }

    /// Suspend the guest and return the snapshot it leaves behind.
    pub async fn suspend(&self) -> Result<InstanceSnapshot> {
        if !self.transition(InstanceState::Started, InstanceState::Suspending) {
            return Err(RuntimeError::InvalidState(format!(
                "cannot suspend {} instance",
                self.state()
            )));
        }
        tracing::info!(instance = %self.id, "suspending instance");
        self.control.suspend();

        let status = self.wait().await;
        lock(&self.snapshot).take().ok_or_else(|| {
            RuntimeError::InvalidState(format!(
                "instance {} while suspending",
                status.state
            ))
        })
    }

    /// Terminate the instance without a snapshot. Does nothing if it has
    /// already ended.
    pub fn kill(&self) {
        if self.finish(Status::with_cause(InstanceState::Killed, TrapId::KILLED)) {
            tracing::info!(instance = %self.id, "killing instance");
            self.control.kill();
            self.ctx.cancel();
        }
    }

    /// Wait for a terminal status.
    pub async fn wait(&self) -> Status {
        let mut rx = self.status.subscribe();
        let done = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| s.clone());
        done.unwrap_or_else(|_| self.status())
    }
}

fn is_services_info(p: &Buf) -> bool {
    p.code() == Code::SERVICES && p.domain() == Domain::INFO
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}
