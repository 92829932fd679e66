//! Catalog service: tells the guest which services the host has.
//!
//! A Call whose content is `json` is answered with
//! `{"services":[{"name":..,"revision":..,"streams":..},..]}`, sorted by
//! name. Any other call gets an empty reply.
//!
//! The catalog lists the registry it was created with, so it is usually
//! registered in a layer on top of that registry:
//!
//! ```ignore
//! let base = Arc::new(base);
//! let mut layer = base.clone_layer();
//! layer.register(Arc::new(Catalog::new(base.clone())))?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use gate_packet::{Buf, Code, Domain, Error, Result, HEADER_SIZE};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::service::{Factory, Instance, InstanceConfig, PacketSender, Service};

pub const SERVICE_NAME: &str = "catalog";

#[derive(Serialize)]
struct Listing {
    services: Vec<Service>,
}

pub struct Catalog {
    registry: Arc<Registry>,
}

impl Catalog {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Factory for Catalog {
    fn service(&self) -> Service {
        Service::new(SERVICE_NAME, "0")
    }

    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        config: InstanceConfig,
        _snapshot: Option<&[u8]>,
    ) -> Result<Arc<dyn Instance>> {
        Ok(Arc::new(CatalogInstance {
            registry: self.registry.clone(),
            code: config.service.code,
            max_content: config.service.max_send_size.saturating_sub(HEADER_SIZE),
        }))
    }
}

struct CatalogInstance {
    registry: Arc<Registry>,
    code: Code,
    max_content: usize,
}

impl CatalogInstance {
    fn listing(&self) -> Result<Vec<u8>> {
        let listing = Listing {
            services: self.registry.catalog(),
        };
        let json = serde_json::to_vec(&listing)
            .map_err(|e| Error::internal("catalog is unavailable", e.to_string()))?;
        if json.len() > self.max_content {
            return Err(Error::internal(
                "catalog is unavailable",
                format!("{} bytes of JSON exceed the packet size", json.len()),
            ));
        }
        Ok(json)
    }
}

#[async_trait]
impl Instance for CatalogInstance {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        _send: &PacketSender,
        p: Buf,
    ) -> Result<Option<Buf>> {
        if p.domain() != Domain::CALL {
            return Ok(None);
        }
        let content = if p.content() == b"json" {
            self.listing()?
        } else {
            Vec::new()
        };
        let mut reply = Buf::make_call(self.code, content.len());
        reply.content_mut().copy_from_slice(&content);
        Ok(Some(reply))
    }

    async fn shutdown(&self, _ctx: &CancellationToken, _suspend: bool) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
