use std::sync::Arc;
use std::time::Duration;

use gate_packet::{Buf, Code, Domain, ErrorKind, ServiceConfig};
use gate_service::origin::{Connector, OriginConfig};
use gate_service::{Abort, Factory, Instance, InstanceConfig};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CODE: Code = Code::new(0);

fn origin() -> Arc<Connector> {
    Arc::new(Connector::new(OriginConfig {
        max_conns: 2,
        buffer_size: 8,
    }))
}

fn instance_config() -> InstanceConfig {
    InstanceConfig {
        service: ServiceConfig::new(CODE, 1024),
        instance: Uuid::new_v4(),
        principal: None,
    }
}

async fn start(
    connector: &Connector,
    snapshot: Option<&[u8]>,
) -> (Arc<dyn Instance>, mpsc::Sender<Buf>, mpsc::Receiver<Buf>) {
    start_with_queue(connector, snapshot, 16).await
}

async fn start_with_queue(
    connector: &Connector,
    snapshot: Option<&[u8]>,
    queue: usize,
) -> (Arc<dyn Instance>, mpsc::Sender<Buf>, mpsc::Receiver<Buf>) {
    let ctx = CancellationToken::new();
    let instance = connector
        .create_instance(&ctx, instance_config(), snapshot)
        .await
        .unwrap();
    let (tx, rx) = mpsc::channel(queue);
    let (abort, _) = Abort::channel();
    instance.start(&ctx, tx.clone(), abort).await.unwrap();
    (instance, tx, rx)
}

async fn recv_domain(rx: &mut mpsc::Receiver<Buf>, domain: Domain) -> Buf {
    loop {
        let p = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("channel closed");
        if p.domain() == domain {
            return p;
        }
    }
}

async fn accept(instance: &Arc<dyn Instance>, tx: &mpsc::Sender<Buf>) {
    let ctx = CancellationToken::new();
    let reply = instance
        .handle(&ctx, tx, Buf::make_call(CODE, 0))
        .await
        .unwrap();
    assert!(reply.is_none());
}

#[tokio::test]
async fn accept_then_connect() {
    let connector = origin();
    let (instance, tx, mut rx) = start(&connector, None).await;
    let ctx = CancellationToken::new();

    accept(&instance, &tx).await;
    let conn = connector.connect(&ctx).await.unwrap();
    assert_eq!(conn.id(), 0);

    let reply = recv_domain(&mut rx, Domain::CALL).await;
    assert_eq!(reply.code(), CODE);
    assert_eq!(reply.content(), &0i32.to_le_bytes());

    let (mut host, local) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(local);
    let task_ctx = ctx.clone();
    tokio::spawn(async move { conn.transfer(&task_ctx, Some(reader), Some(writer)).await });

    let flow = recv_domain(&mut rx, Domain::FLOW).await;
    assert_eq!(flow.flow(0).id, 0);
    assert_eq!(flow.flow(0).value, 8);

    host.write_all(b"ABCD").await.unwrap();
    instance
        .handle(&ctx, &tx, Buf::make_flow(CODE, 0, 4))
        .await
        .unwrap();
    let data = recv_domain(&mut rx, Domain::DATA).await;
    assert_eq!(data.data_id(), 0);
    assert_eq!(data.data(), b"ABCD");
}

#[tokio::test]
async fn connect_waits_for_accept() {
    let connector = origin();
    let (instance, tx, _rx) = start(&connector, None).await;
    let ctx = CancellationToken::new();

    let early = tokio::time::timeout(Duration::from_millis(50), connector.connect(&ctx)).await;
    assert!(early.is_err());

    accept(&instance, &tx).await;
    assert!(connector.connect(&ctx).await.is_some());
    assert_eq!(connector.accepting(), 0);
}

#[tokio::test]
async fn connect_gives_up_on_cancel() {
    let connector = origin();
    let _started = start(&connector, None).await;
    let ctx = CancellationToken::new();
    ctx.cancel();
    assert!(connector.connect(&ctx).await.is_none());
}

#[tokio::test]
async fn closed_connector_refuses() {
    let connector = origin();
    let (instance, tx, _rx) = start(&connector, None).await;
    accept(&instance, &tx).await;
    connector.close();
    assert!(connector.connect(&CancellationToken::new()).await.is_none());
}

#[tokio::test]
async fn unknown_stream_is_bad_program() {
    let connector = origin();
    let (instance, tx, _rx) = start(&connector, None).await;
    let ctx = CancellationToken::new();

    let err = instance
        .handle(&ctx, &tx, Buf::make_flow(CODE, 5, 1))
        .await
        .unwrap_err();
    assert!(err.is_bad_program());

    let err = instance
        .handle(&ctx, &tx, Buf::make_data_eof(CODE, 5))
        .await
        .unwrap_err();
    assert!(err.is_bad_program());
}

#[tokio::test]
async fn second_instance_is_conflict() {
    let connector = origin();
    let _first = start(&connector, None).await;
    let result = connector
        .create_instance(&CancellationToken::new(), instance_config(), None)
        .await;
    assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Conflict));
}

#[tokio::test]
async fn suspend_keeps_accepts_and_streams() {
    let connector = origin();
    let (instance, tx, mut rx) = start(&connector, None).await;
    let ctx = CancellationToken::new();

    accept(&instance, &tx).await;
    accept(&instance, &tx).await;
    let conn = connector.connect(&ctx).await.unwrap();
    recv_domain(&mut rx, Domain::CALL).await;

    let (_host, local) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(local);
    let task_ctx = ctx.clone();
    let task =
        tokio::spawn(async move { conn.transfer(&task_ctx, Some(reader), Some(writer)).await });
    recv_domain(&mut rx, Domain::FLOW).await;
    instance
        .handle(&ctx, &tx, Buf::make_flow(CODE, 0, 5))
        .await
        .unwrap();

    let snapshot = instance.shutdown(&ctx, true).await.unwrap().unwrap();
    task.await.unwrap().unwrap();

    let resumed = origin();
    let (_instance, _tx, mut rx) = start(&resumed, Some(&snapshot)).await;
    assert_eq!(resumed.accepting(), 1);

    // The restored stream has no host peer, so the guest sees EOF.
    let data = recv_domain(&mut rx, Domain::DATA).await;
    assert_eq!(data.data_id(), 0);
    assert_eq!(data.data_len(), 0);
}

#[tokio::test]
async fn idle_shutdown_has_no_snapshot() {
    let connector = origin();
    let (instance, _tx, _rx) = start(&connector, None).await;
    let snapshot = instance
        .shutdown(&CancellationToken::new(), true)
        .await
        .unwrap();
    assert!(snapshot.is_none());
}

#[tokio::test]
async fn unsent_data_is_delivered_once_after_restore() {
    let connector = origin();
    let (instance, tx, mut rx) = start_with_queue(&connector, None, 1).await;
    let ctx = CancellationToken::new();

    accept(&instance, &tx).await;
    let conn = connector.connect(&ctx).await.unwrap();
    recv_domain(&mut rx, Domain::CALL).await;

    let (mut host, local) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(local);
    let task_ctx = ctx.clone();
    let task =
        tokio::spawn(async move { conn.transfer(&task_ctx, Some(reader), Some(writer)).await });

    // The credit grant takes the only queue slot, so the data read next
    // cannot be sent.
    tokio::time::sleep(Duration::from_millis(50)).await;
    host.write_all(b"ABCD").await.unwrap();
    instance
        .handle(&ctx, &tx, Buf::make_flow(CODE, 0, 4))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = instance.shutdown(&ctx, true).await.unwrap().unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(rx.recv().await.unwrap().domain(), Domain::FLOW);
    assert!(rx.try_recv().is_err());

    let resumed = origin();
    let (_instance, _tx, mut rx) = start(&resumed, Some(&snapshot)).await;
    let data = recv_domain(&mut rx, Domain::DATA).await;
    assert_eq!(data.data_id(), 0);
    assert_eq!(data.data(), b"ABCD");
    let eof = recv_domain(&mut rx, Domain::DATA).await;
    assert_eq!(eof.data_len(), 0);

    let extra = tokio::time::timeout(
        Duration::from_millis(200),
        recv_domain(&mut rx, Domain::DATA),
    )
    .await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn idle_conn_does_not_hold_up_shutdown() {
    let connector = origin();
    let (instance, tx, mut rx) = start(&connector, None).await;
    let ctx = CancellationToken::new();

    accept(&instance, &tx).await;
    let conn = connector.connect(&ctx).await.unwrap();
    recv_domain(&mut rx, Domain::CALL).await;

    let snapshot = tokio::time::timeout(Duration::from_secs(5), instance.shutdown(&ctx, true))
        .await
        .expect("shutdown waited for an idle conn")
        .unwrap();
    assert!(snapshot.is_some());

    // Too late: the stream stays as it was.
    let (_host, local) = tokio::io::duplex(64);
    let (reader, writer) = tokio::io::split(local);
    conn.transfer(&ctx, Some(reader), Some(writer))
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
}
