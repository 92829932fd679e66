use std::sync::Arc;

use async_trait::async_trait;
use gate_packet::{Buf, Domain, Error, Result};
use gate_packetio::Stream;
use tokio_util::sync::CancellationToken;

use super::{marshal, Active, Shared};
use crate::lock;
use crate::service::{Abort, Instance, PacketSender};

pub(super) struct OriginInstance {
    shared: Arc<Shared>,
    restored: Vec<Arc<Stream>>,
}

impl OriginInstance {
    pub(super) fn new(shared: Arc<Shared>, restored: Vec<Arc<Stream>>) -> Self {
        Self { shared, restored }
    }

    fn stream(&self, id: i32) -> Result<Arc<Stream>> {
        lock(&self.shared.state)
            .streams
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::bad_program(format!("origin stream {id} does not exist")))
    }
}

#[async_trait]
impl Instance for OriginInstance {
    fn max_domain(&self) -> Domain {
        Domain::DATA
    }

    async fn start(&self, ctx: &CancellationToken, send: PacketSender, _abort: Abort) -> Result<()> {
        let config = {
            let mut state = lock(&self.shared.state);
            state.send = Some(send.clone());
            state.service
        };
        self.shared.poke();

        let Some(config) = config else {
            return Ok(());
        };
        for stream in &self.restored {
            let active = Active::new(&self.shared);
            let shared = self.shared.clone();
            let stream = stream.clone();
            let ctx = ctx.clone();
            let send = send.clone();
            tokio::spawn(async move {
                let _active = active;
                let result = stream
                    .transfer(
                        &ctx,
                        &config,
                        None::<tokio::io::Empty>,
                        None::<tokio::io::Sink>,
                        &send,
                    )
                    .await;
                if let Err(e) = result {
                    tracing::debug!(stream = stream.id(), error = %e, "restored origin stream failed");
                }
                shared.release(&stream);
            });
        }
        Ok(())
    }

    async fn handle(
        &self,
        _ctx: &CancellationToken,
        _send: &PacketSender,
        p: Buf,
    ) -> Result<Option<Buf>> {
        match p.domain() {
            Domain::CALL => {
                {
                    let mut state = lock(&self.shared.state);
                    state.accepting = state.accepting.saturating_add(1);
                }
                self.shared.poke();
            }
            Domain::FLOW => {
                for flow in p.flows() {
                    self.stream(flow.id)?.handle_flow(flow.value)?;
                }
            }
            Domain::DATA => {
                self.stream(p.data_id())?.handle_data(p.data())?;
            }
            _ => {}
        }
        Ok(None)
    }

    async fn shutdown(&self, ctx: &CancellationToken, suspend: bool) -> Result<Option<Vec<u8>>> {
        lock(&self.shared.state).shutting = true;
        self.shared.shutting.cancel();
        self.shared.poke();

        if !self.shared.wait_until(ctx, |s| !s.replying).await {
            return Err(Error::Cancelled);
        }
        let streams: Vec<Arc<Stream>> = lock(&self.shared.state)
            .streams
            .values()
            .cloned()
            .collect();
        for stream in &streams {
            stream.stop();
        }
        if !self.shared.wait_until(ctx, |s| s.active == 0).await {
            return Err(Error::Cancelled);
        }

        let mut state = lock(&self.shared.state);
        if !suspend {
            state.streams.clear();
            return Ok(None);
        }
        state.streams.retain(|_, stream| stream.is_live());
        if state.accepting == 0 && state.streams.is_empty() {
            return Ok(None);
        }
        Ok(Some(marshal(state.accepting, &state.streams)))
    }
}
