//! Service traits.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gate_packet::{Buf, Domain, Error, Result, ServiceConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lock;

/// Channel on which services send packets to the guest.
pub type PacketSender = mpsc::Sender<Buf>;

/// Service description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub revision: String,
    /// The service uses Flow and Data packets.
    #[serde(default)]
    pub streams: bool,
}

impl Service {
    pub fn new(name: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: revision.into(),
            streams: false,
        }
    }

    pub fn with_streams(mut self) -> Self {
        self.streams = true;
        self
    }
}

/// Everything a factory gets to know about the instance it serves.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub service: ServiceConfig,
    /// Program instance id.
    pub instance: Uuid,
    /// Owner of the program instance, if known.
    pub principal: Option<String>,
}

/// Creates service instances.
#[async_trait]
pub trait Factory: Send + Sync {
    fn service(&self) -> Service;

    /// Whether the service may be bound in response to a discovery request.
    async fn discoverable(&self, _ctx: &CancellationToken) -> bool {
        true
    }

    /// Create an instance, restoring it from `snapshot` when one is given.
    async fn create_instance(
        &self,
        ctx: &CancellationToken,
        config: InstanceConfig,
        snapshot: Option<&[u8]>,
    ) -> Result<Arc<dyn Instance>>;
}

/// One service's state within one program instance.
///
/// The server calls [`Instance::ready`] once, then [`Instance::start`] once,
/// then [`Instance::handle`] for each packet in arrival order, and finally
/// [`Instance::shutdown`].
#[async_trait]
pub trait Instance: Send + Sync {
    /// Highest packet domain the instance accepts.
    fn max_domain(&self) -> Domain {
        Domain::INFO
    }

    async fn ready(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// `send` may be kept and used from background tasks until shutdown.
    async fn start(
        &self,
        _ctx: &CancellationToken,
        _send: PacketSender,
        _abort: Abort,
    ) -> Result<()> {
        Ok(())
    }

    /// Handle a packet. A returned packet is sent to the guest as the reply.
    async fn handle(
        &self,
        ctx: &CancellationToken,
        send: &PacketSender,
        p: Buf,
    ) -> Result<Option<Buf>>;

    /// Stop. With `suspend` the returned bytes are the instance's snapshot.
    async fn shutdown(&self, ctx: &CancellationToken, suspend: bool) -> Result<Option<Vec<u8>>>;
}

/// Terminates the program instance with an error. Only the first call has
/// any effect.
#[derive(Clone)]
pub struct Abort {
    tx: Arc<Mutex<Option<oneshot::Sender<Error>>>>,
}

impl Abort {
    pub fn channel() -> (Abort, oneshot::Receiver<Error>) {
        let (tx, rx) = oneshot::channel();
        (
            Abort {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn abort(&self, err: Error) {
        if let Some(tx) = lock(&self.tx).take() {
            let _ = tx.send(err);
        }
    }
}

impl fmt::Debug for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Abort")
            .field("armed", &lock(&self.tx).is_some())
            .finish()
    }
}
