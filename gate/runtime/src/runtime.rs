//! Runtime coordinator for modules and instances.
//!
//! The Runtime is responsible for:
//! - Storing program modules
//! - Launching instances from modules, optionally resuming a snapshot
//! - Tracking instance lifecycles until they are removed

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use gate_packet::MAX_PACKET_SIZE;
use gate_service::Registry;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::instance::{Instance, InstanceId, Status};
use crate::lock;
use crate::sandbox::{DebugSink, ProgramImage, Sandbox};
use crate::snapshot::InstanceSnapshot;
use crate::storage::{ModuleId, ModuleStorage};

/// Configuration for the Gate runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of instances, terminated ones included until removed.
    pub max_instances: usize,
    /// Maximum number of stored modules.
    pub max_modules: usize,
    /// Largest packet a service may send.
    pub max_send_size: usize,
    /// Depth of each instance's queue of packets to the guest.
    pub outbound_capacity: usize,
    /// Depth of each instance's queue of packets from the guest.
    pub inbound_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_instances: 1024,
            max_modules: 256,
            max_send_size: MAX_PACKET_SIZE,
            outbound_capacity: 16,
            inbound_capacity: 16,
        }
    }
}

/// Launch parameters beyond the module.
#[derive(Default)]
pub struct LaunchOptions {
    /// Resume from this snapshot instead of starting fresh.
    pub snapshot: Option<InstanceSnapshot>,
    pub debug: Option<DebugSink>,
    /// Owner of the instance.
    pub principal: Option<String>,
}

/// The Gate runtime.
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::new(config, registry, sandbox, Arc::new(MemoryStorage::new()));
/// let module = runtime.upload_module(wasm).await?;
/// let id = runtime.launch(&module, LaunchOptions::default()).await?;
/// let snapshot = runtime.suspend(id).await?;
/// ```
pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    sandbox: Arc<dyn Sandbox>,
    storage: Arc<dyn ModuleStorage>,
    ctx: CancellationToken,
    instances: Mutex<BTreeMap<InstanceId, Arc<Instance>>>,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<Registry>,
        sandbox: Arc<dyn Sandbox>,
        storage: Arc<dyn ModuleStorage>,
    ) -> Self {
        Self {
            config,
            registry,
            sandbox,
            storage,
            ctx: CancellationToken::new(),
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Store a module and return its id.
    pub async fn upload_module(&self, bytes: Vec<u8>) -> Result<ModuleId> {
        let id = ModuleId::of(&bytes);
        if self.storage.open_module(&id).await?.is_some() {
            return Ok(id);
        }
        if self.storage.module_count().await? >= self.config.max_modules {
            return Err(RuntimeError::ModuleLimit(self.config.max_modules));
        }
        let stored = self.storage.put_module(bytes).await?;
        tracing::debug!(module = %stored, "module stored");
        Ok(stored)
    }

    async fn load_module(&self, module: &ModuleId) -> Result<ProgramImage> {
        let mut reader = self
            .storage
            .open_module(module)
            .await?
            .ok_or_else(|| RuntimeError::ModuleNotFound(module.to_string()))?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        Ok(ProgramImage {
            module: module.clone(),
            bytes,
        })
    }

    fn check_capacity(&self) -> Result<()> {
        if lock(&self.instances).len() >= self.config.max_instances {
            return Err(RuntimeError::InstanceLimit(self.config.max_instances));
        }
        Ok(())
    }

    /// Spawn a guest for `module`, start its services and serve it in a new
    /// task. The returned instance is already started.
    pub async fn launch(&self, module: &ModuleId, options: LaunchOptions) -> Result<InstanceId> {
        self.check_capacity()?;
        let image = self.load_module(module).await?;
        let guest = self.sandbox.spawn(image, options.debug).await?;

        let id = InstanceId::new();
        let instance = Arc::new(
            Instance::new(
                &self.ctx,
                id,
                guest,
                self.registry.clone(),
                &self.config,
                options.snapshot,
                options.principal,
            )
            .await?,
        );

        {
            let mut instances = lock(&self.instances);
            if instances.len() >= self.config.max_instances {
                drop(instances);
                instance.kill();
                tokio::spawn(instance.run());
                return Err(RuntimeError::InstanceLimit(self.config.max_instances));
            }
            instances.insert(id, instance.clone());
        }

        if let Err(e) = instance.start().await {
            instance.release().await;
            lock(&self.instances).remove(&id);
            return Err(e);
        }
        tracing::info!(instance = %id, module = %module, "instance launched");
        tokio::spawn(async move { instance.serve().await });
        Ok(id)
    }

    fn instance(&self, id: InstanceId) -> Result<Arc<Instance>> {
        lock(&self.instances)
            .get(&id)
            .cloned()
            .ok_or(RuntimeError::InstanceNotFound(id.as_uuid()))
    }

    pub fn status(&self, id: InstanceId) -> Result<Status> {
        Ok(self.instance(id)?.status())
    }

    /// Suspend an instance and return its snapshot.
    pub async fn suspend(&self, id: InstanceId) -> Result<InstanceSnapshot> {
        self.instance(id)?.suspend().await
    }

    pub fn kill(&self, id: InstanceId) -> Result<()> {
        self.instance(id)?.kill();
        Ok(())
    }

    /// Wait for an instance to end.
    pub async fn wait(&self, id: InstanceId) -> Result<Status> {
        Ok(self.instance(id)?.wait().await)
    }

    /// Forget an instance that has ended.
    pub fn remove(&self, id: InstanceId) -> Result<Status> {
        let mut instances = lock(&self.instances);
        let instance = instances
            .get(&id)
            .ok_or(RuntimeError::InstanceNotFound(id.as_uuid()))?;
        let status = instance.status();
        if !status.state.is_terminal() {
            return Err(RuntimeError::InvalidState(format!(
                "cannot remove {} instance",
                status.state
            )));
        }
        instances.remove(&id);
        Ok(status)
    }

    /// List all instance IDs.
    pub fn instances(&self) -> Vec<InstanceId> {
        lock(&self.instances).keys().copied().collect()
    }

    pub fn instance_count(&self) -> usize {
        lock(&self.instances).len()
    }

    /// Cancel every instance and wait for all of them to end.
    pub async fn shutdown(&self) {
        self.ctx.cancel();
        let instances: Vec<Arc<Instance>> = lock(&self.instances).values().cloned().collect();
        for instance in instances {
            instance.wait().await;
        }
    }
}
