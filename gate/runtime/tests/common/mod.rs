//! A scripted sandbox: each spawned guest is handed to the test, which plays
//! the program's side of the pipe.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gate_packet::{Buf, Domain, Result as GateResult};
use gate_runtime::{
    read_packet, write_packet, DebugSink, ExitInfo, Guest, GuestControl, ProgramImage, Result,
    Sandbox, TrapId,
};
use gate_service::{Factory, Instance, InstanceConfig, PacketSender, Service};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

pub const WASM: &[u8] = b"\0asm\x01\0\0\0";

pub struct TestSandbox {
    guests: mpsc::UnboundedSender<TestGuest>,
}

impl TestSandbox {
    pub fn channel() -> (Arc<Self>, GuestQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { guests: tx }), GuestQueue(Mutex::new(rx)))
    }
}

pub struct GuestQueue(Mutex<mpsc::UnboundedReceiver<TestGuest>>);

impl GuestQueue {
    pub async fn next(&self) -> TestGuest {
        let mut rx = self.0.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for spawn")
            .expect("sandbox dropped")
    }
}

#[async_trait]
impl Sandbox for TestSandbox {
    async fn spawn(&self, _image: ProgramImage, _debug: Option<DebugSink>) -> Result<Guest> {
        let (host, guest) = tokio::io::duplex(1 << 16);
        let (host_r, host_w) = tokio::io::split(host);
        let (guest_r, guest_w) = tokio::io::split(guest);
        let control = Arc::new(TestControl::new());
        let _ = self.guests.send(TestGuest {
            reader: guest_r,
            writer: guest_w,
            control: control.clone(),
        });
        Ok(Guest {
            reader: Box::new(host_r),
            writer: Box::new(host_w),
            control,
        })
    }
}

pub struct TestControl {
    suspended: watch::Sender<bool>,
    exit: watch::Sender<Option<ExitInfo>>,
}

impl TestControl {
    fn new() -> Self {
        Self {
            suspended: watch::channel(false).0,
            exit: watch::channel(None).0,
        }
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }
}

#[async_trait]
impl GuestControl for TestControl {
    fn suspend(&self) {
        self.suspended.send_replace(true);
    }

    fn kill(&self) {
        self.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(ExitInfo::Trapped(TrapId::KILLED));
                true
            } else {
                false
            }
        });
    }

    async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.subscribe();
        let exit = rx.wait_for(Option::is_some).await.map(|e| *e);
        exit.ok().flatten().unwrap_or(ExitInfo::Signaled)
    }
}

/// The program end of an instance.
pub struct TestGuest {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    pub control: Arc<TestControl>,
}

impl TestGuest {
    pub async fn send(&mut self, mut p: Buf) {
        p.finalize();
        write_packet(&mut self.writer, &p).await.unwrap();
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<Buf> {
        tokio::time::timeout(wait, read_packet(&mut self.reader))
            .await
            .ok()
            .and_then(|p| p.unwrap())
    }

    pub async fn recv(&mut self) -> Buf {
        self.try_recv(Duration::from_secs(5))
            .await
            .expect("timed out waiting for packet")
    }

    pub async fn recv_domain(&mut self, domain: Domain) -> Buf {
        loop {
            let p = self.recv().await;
            if p.domain() == domain {
                return p;
            }
        }
    }

    pub async fn suspend_requested(&self) {
        let mut rx = self.control.suspended.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s))
            .await
            .expect("timed out waiting for suspend")
            .unwrap();
    }

    /// Close the pipe and exit.
    pub fn exit(self, info: ExitInfo) {
        let control = self.control.clone();
        drop(self);
        control.exit.send_replace(Some(info));
    }
}

/// Replies to each Call with its own content.
pub struct Echo;

#[async_trait]
impl Factory for Echo {
    fn service(&self) -> Service {
        Service::new("echo", "1")
    }

    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        config: InstanceConfig,
        _snapshot: Option<&[u8]>,
    ) -> GateResult<Arc<dyn Instance>> {
        Ok(Arc::new(EchoInstance(config)))
    }
}

struct EchoInstance(InstanceConfig);

#[async_trait]
impl Instance for EchoInstance {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        _send: &PacketSender,
        p: Buf,
    ) -> GateResult<Option<Buf>> {
        let mut reply = Buf::make_call(self.0.service.code, p.content().len());
        reply.content_mut().copy_from_slice(p.content());
        Ok(Some(reply))
    }

    async fn shutdown(
        &self,
        _ctx: &CancellationToken,
        _suspend: bool,
    ) -> GateResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Echo under another name.
pub struct Named(pub &'static str);

#[async_trait]
impl Factory for Named {
    fn service(&self) -> Service {
        Service::new(self.0, "0")
    }

    async fn create_instance(
        &self,
        _ctx: &CancellationToken,
        config: InstanceConfig,
        _snapshot: Option<&[u8]>,
    ) -> GateResult<Arc<dyn Instance>> {
        Ok(Arc::new(EchoInstance(config)))
    }
}
