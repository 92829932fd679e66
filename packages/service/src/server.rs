//! Per-instance service multiplexer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use gate_packet::services::{make_services, parse_services_request};
use gate_packet::{
    Buf, Code, Domain, Error, Result, ServiceConfig, ServiceState, MAX_PACKET_SIZE, MAX_SERVICES,
};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lock;
use crate::registry::Registry;
use crate::service::{Abort, Factory, Instance, InstanceConfig, PacketSender};

/// Settings shared by every service slot of one program instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_send_size: usize,
    pub instance: Uuid,
    pub principal: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_send_size: MAX_PACKET_SIZE,
            instance: Uuid::nil(),
            principal: None,
        }
    }
}

/// A service's name and snapshot bytes, in code order.
///
/// Unavailable services and services without state have empty buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub name: String,
    pub buffer: Vec<u8>,
}

impl ServiceSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: Vec::new(),
        }
    }
}

/// Where a service slot is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No factory by that name.
    Unavailable,
    /// Bound to a factory; the instance may not exist yet.
    Available,
    Started,
    ShuttingDown,
    Done,
}

struct Slot {
    name: String,
    factory: Option<Arc<dyn Factory>>,
    instance: Option<Arc<dyn Instance>>,
    lifecycle: Lifecycle,
}

impl Slot {
    fn new(name: String, factory: Option<Arc<dyn Factory>>) -> Self {
        let lifecycle = if factory.is_some() {
            Lifecycle::Available
        } else {
            Lifecycle::Unavailable
        };
        Self {
            name,
            factory,
            instance: None,
            lifecycle,
        }
    }

    fn state(&self) -> ServiceState {
        if self.factory.is_some() {
            ServiceState::available()
        } else {
            ServiceState::unavailable()
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    bound: HashSet<usize>,
    started: bool,
    shut_down: bool,
}

enum Target {
    Ready(Arc<dyn Instance>),
    Create(Arc<dyn Factory>),
    Discard,
}

/// Owns the service slots of one program instance.
///
/// A slot's position is its service code. Slots only ever get appended, so
/// codes never change during the life of an instance, and a suspended
/// instance gets its slots back in the same order.
pub struct Server {
    registry: Arc<Registry>,
    config: ServerConfig,
    send: PacketSender,
    abort: Abort,
    inner: Mutex<Inner>,
}

/// Factory identity, so that one service is never bound to two codes.
fn factory_key(factory: &Arc<dyn Factory>) -> usize {
    Arc::as_ptr(factory) as *const () as usize
}

impl Server {
    /// Create the server with the services of a resumed instance.
    ///
    /// Instances are created and made ready for every known name in
    /// `initial`. Returns the initial service states and the receiving end
    /// of the abort channel shared by all services.
    pub async fn create(
        registry: Arc<Registry>,
        ctx: &CancellationToken,
        config: ServerConfig,
        initial: &[ServiceSnapshot],
        send: PacketSender,
    ) -> Result<(Server, Vec<ServiceState>, oneshot::Receiver<Error>)> {
        if initial.len() > MAX_SERVICES {
            return Err(Error::ResourceLimit(format!(
                "{} services exceed the limit of {MAX_SERVICES}",
                initial.len()
            )));
        }
        let (abort, abort_rx) = Abort::channel();

        let mut slots = Vec::with_capacity(initial.len());
        let mut bound = HashSet::new();
        for (code, snapshot) in initial.iter().enumerate() {
            let factory = registry.lookup(&snapshot.name);
            let mut slot = Slot::new(snapshot.name.clone(), factory.clone());
            if let Some(factory) = factory {
                if !bound.insert(factory_key(&factory)) {
                    return Err(Error::Conflict(format!(
                        "service {} appears twice",
                        snapshot.name
                    )));
                }
                let buffer = (!snapshot.buffer.is_empty()).then_some(&snapshot.buffer[..]);
                let instance = factory
                    .create_instance(ctx, instance_config(&config, code), buffer)
                    .await?;
                slot.instance = Some(instance);
            }
            slots.push(slot);
        }

        for slot in &slots {
            if let Some(instance) = &slot.instance {
                instance.ready(ctx).await?;
            }
        }

        let states = slots.iter().map(Slot::state).collect();
        let server = Server {
            registry,
            config,
            send,
            abort,
            inner: Mutex::new(Inner {
                slots,
                bound,
                started: false,
                shut_down: false,
            }),
        };
        Ok((server, states, abort_rx))
    }

    pub fn num_services(&self) -> usize {
        lock(&self.inner).slots.len()
    }

    pub fn lifecycle(&self, code: Code) -> Option<Lifecycle> {
        let inner = lock(&self.inner);
        code.index()
            .and_then(|i| inner.slots.get(i))
            .map(|slot| slot.lifecycle)
    }

    /// A handle that aborts the program instance.
    pub fn abort_handle(&self) -> Abort {
        self.abort.clone()
    }

    /// Start every instance created so far.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let instances: Vec<(usize, Arc<dyn Instance>)> = {
            let mut inner = lock(&self.inner);
            inner.started = true;
            inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.instance.clone().map(|inst| (i, inst)))
                .collect()
        };
        for (i, instance) in instances {
            instance
                .start(ctx, self.send.clone(), self.abort.clone())
                .await?;
            lock(&self.inner).slots[i].lifecycle = Lifecycle::Started;
        }
        Ok(())
    }

    /// Bind new names to slots and return the states of all slots.
    ///
    /// Binding a factory that already has a slot is a conflict, and nothing
    /// is bound in that case.
    pub async fn discover(
        &self,
        ctx: &CancellationToken,
        names: Vec<String>,
    ) -> Result<Vec<ServiceState>> {
        let mut found = Vec::with_capacity(names.len());
        for name in names {
            let factory = match self.registry.lookup(&name) {
                Some(f) if f.discoverable(ctx).await => Some(f),
                _ => None,
            };
            found.push((name, factory));
        }

        let mut inner = lock(&self.inner);
        if inner.slots.len() + found.len() > MAX_SERVICES {
            return Err(Error::ResourceLimit(format!(
                "more than {MAX_SERVICES} services"
            )));
        }
        let mut keys = Vec::new();
        for (name, factory) in &found {
            if let Some(factory) = factory {
                let key = factory_key(factory);
                if inner.bound.contains(&key) || keys.contains(&key) {
                    return Err(Error::Conflict(format!("service {name} discovered twice")));
                }
                keys.push(key);
            }
        }
        inner.bound.extend(keys);
        for (name, factory) in found {
            tracing::debug!(service = %name, available = factory.is_some(), "discovered");
            inner.slots.push(Slot::new(name, factory));
        }
        Ok(inner.slots.iter().map(Slot::state).collect())
    }

    /// Answer a discovery request.
    pub async fn handle_services_packet(&self, ctx: &CancellationToken, p: &Buf) -> Result<Buf> {
        let current = self.num_services();
        let names = parse_services_request(p, current)?;
        let states = self.discover(ctx, names).await?;
        let mut reply = make_services(Domain::CALL, &states);
        reply.set_index(p.index());
        Ok(reply)
    }

    /// Route a guest packet to its service.
    ///
    /// The instance is created on first use. Packets for unavailable
    /// services are dropped. A returned Call reply carries the index of the
    /// request.
    pub async fn handle(&self, ctx: &CancellationToken, p: Buf) -> Result<Option<Buf>> {
        let code = p.code();
        if code == Code::SERVICES {
            return self.handle_services_packet(ctx, &p).await.map(Some);
        }
        let index = code
            .index()
            .ok_or_else(|| Error::bad_program(format!("invalid service code {}", code.get())))?;

        let (name, target) = {
            let inner = lock(&self.inner);
            if inner.shut_down {
                return Ok(None);
            }
            let slot = inner.slots.get(index).ok_or_else(|| {
                Error::bad_program(format!("service code {} has not been discovered", code.get()))
            })?;
            let target = match (&slot.instance, &slot.factory) {
                (Some(instance), _) => Target::Ready(instance.clone()),
                (None, Some(factory)) => Target::Create(factory.clone()),
                (None, None) => Target::Discard,
            };
            (slot.name.clone(), target)
        };

        let instance = match target {
            Target::Ready(instance) => instance,
            Target::Create(factory) => self.create_instance(ctx, index, &factory).await?,
            Target::Discard => {
                tracing::debug!(service = %name, packet = %p, "dropped packet for unavailable service");
                return Ok(None);
            }
        };

        let domain = p.domain();
        if domain > instance.max_domain() {
            return Err(Error::bad_program(format!(
                "{domain} packet sent to service {name}"
            )));
        }

        let request_index = p.index();
        let reply = instance.handle(ctx, &self.send, p).await?;
        Ok(reply.map(|mut r| {
            if r.domain() == Domain::CALL {
                r.set_index(request_index);
            }
            r
        }))
    }

    async fn create_instance(
        &self,
        ctx: &CancellationToken,
        index: usize,
        factory: &Arc<dyn Factory>,
    ) -> Result<Arc<dyn Instance>> {
        let instance = factory
            .create_instance(ctx, instance_config(&self.config, index), None)
            .await?;
        instance.ready(ctx).await?;
        let started = lock(&self.inner).started;
        if started {
            instance
                .start(ctx, self.send.clone(), self.abort.clone())
                .await?;
        }

        let mut inner = lock(&self.inner);
        let slot = &mut inner.slots[index];
        slot.instance = Some(instance.clone());
        slot.lifecycle = if started {
            Lifecycle::Started
        } else {
            Lifecycle::Available
        };
        Ok(instance)
    }

    /// Shut down every instance concurrently.
    ///
    /// With `suspend`, returns one snapshot per slot in code order. The first
    /// error is returned after all instances have finished. A second call
    /// does nothing and returns no snapshots.
    pub async fn shutdown(
        &self,
        ctx: &CancellationToken,
        suspend: bool,
    ) -> Result<Vec<ServiceSnapshot>> {
        let (names, instances) = {
            let mut inner = lock(&self.inner);
            if inner.shut_down {
                return Ok(Vec::new());
            }
            inner.shut_down = true;
            let names: Vec<String> = inner.slots.iter().map(|s| s.name.clone()).collect();
            let mut instances = Vec::new();
            for (i, slot) in inner.slots.iter_mut().enumerate() {
                if let Some(instance) = slot.instance.clone() {
                    slot.lifecycle = Lifecycle::ShuttingDown;
                    instances.push((i, instance));
                }
            }
            (names, instances)
        };

        let mut tasks = JoinSet::new();
        for (i, instance) in instances {
            let ctx = ctx.clone();
            tasks.spawn(async move { (i, instance.shutdown(&ctx, suspend).await) });
        }

        let mut snapshots: Vec<ServiceSnapshot> =
            names.into_iter().map(ServiceSnapshot::new).collect();
        let mut first_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((i, Ok(buffer))) => {
                    if let Some(buffer) = buffer {
                        snapshots[i].buffer = buffer;
                    }
                    lock(&self.inner).slots[i].lifecycle = Lifecycle::Done;
                }
                Ok((i, Err(e))) => {
                    tracing::warn!(service = %snapshots[i].name, error = %e, "service shutdown failed");
                    lock(&self.inner).slots[i].lifecycle = Lifecycle::Done;
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(Error::internal(
                        "service shutdown failed",
                        e.to_string(),
                    ));
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(if suspend { snapshots } else { Vec::new() })
    }
}

fn instance_config(config: &ServerConfig, index: usize) -> InstanceConfig {
    InstanceConfig {
        service: ServiceConfig::new(Code::new(index as i16), config.max_send_size),
        instance: config.instance,
        principal: config.principal.clone(),
    }
}
