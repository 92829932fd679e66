//! Identity service.
//!
//! The first content byte of a Call selects what is returned:
//! `1` for the principal id and `2` for the instance id. Anything else,
//! or an unknown principal, gets an empty reply.

use std::sync::Arc;

use async_trait::async_trait;
use gate_packet::{Buf, Code, Domain, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::service::{Factory, Instance, InstanceConfig, PacketSender, Service};

pub const SERVICE_NAME: &str = "identity";

const CALL_PRINCIPAL_ID: u8 = 1;
const CALL_INSTANCE_ID: u8 = 2;

#[derive(Debug, Default)]
pub struct Identity;

#[async_trait]
impl Factory for Identity {
    fn service(&self) -> Service {
        Service::new(SERVICE_NAME, "0")
    }

    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        config: InstanceConfig,
        _snapshot: Option<&[u8]>,
    ) -> Result<Arc<dyn Instance>> {
        Ok(Arc::new(IdentityInstance {
            code: config.service.code,
            instance: config.instance,
            principal: config.principal,
        }))
    }
}

struct IdentityInstance {
    code: Code,
    instance: Uuid,
    principal: Option<String>,
}

#[async_trait]
impl Instance for IdentityInstance {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        _send: &PacketSender,
        p: Buf,
    ) -> Result<Option<Buf>> {
        if p.domain() != Domain::CALL {
            return Ok(None);
        }
        let answer = match p.content().first() {
            Some(&CALL_PRINCIPAL_ID) => self.principal.clone().unwrap_or_default(),
            Some(&CALL_INSTANCE_ID) => self.instance.to_string(),
            _ => String::new(),
        };
        let mut reply = Buf::make_call(self.code, answer.len());
        reply.content_mut().copy_from_slice(answer.as_bytes());
        Ok(Some(reply))
    }

    async fn shutdown(&self, _ctx: &CancellationToken, _suspend: bool) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
