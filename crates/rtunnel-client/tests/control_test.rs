mod common;

use common::{http, quiet_common, recv, send, tcp, DuplexConnector, RecordingWebhook};
use rtunnel_client::auth::NoAuthSetter;
use rtunnel_client::config::ClientCommonConfig;
use rtunnel_client::control::{Control, SessionContext};
use rtunnel_client::status::ProxyPhase;
use rtunnel_proto::{Message, NewProxyResp, Pong, ReqWorkConn, StartWorkConn};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

struct Harness {
    ctl: Arc<Control>,
    server: DuplexStream,
    work_rx: mpsc::UnboundedReceiver<DuplexStream>,
}

fn harness(common: ClientCommonConfig) -> Harness {
    let (work_tx, work_rx) = mpsc::unbounded_channel();
    let (client, server) = tokio::io::duplex(common::PIPE_CAPACITY);
    let ctl = Control::new(
        SessionContext {
            common: Arc::new(common),
            run_id: "run-1".to_string(),
            conn_encrypted: false,
            auth_setter: Arc::new(NoAuthSetter),
            connector: Arc::new(DuplexConnector::new(work_tx)),
            webhook: Arc::new(RecordingWebhook::default()),
            wrapper_factory: None,
            work_conn_handler: None,
        },
        Box::new(client),
    );
    Harness {
        ctl,
        server,
        work_rx,
    }
}

async fn wait_done(ctl: &Control) {
    tokio::time::timeout(Duration::from_secs(30), ctl.done())
        .await
        .expect("control did not finish");
}

#[tokio::test]
async fn test_run_registers_proxies_and_applies_responses() {
    let mut h = harness(quiet_common());
    h.ctl.run(&[http("web", 8080)], &[]).await;

    match recv(&mut h.server).await {
        Some(Message::NewProxy(m)) => {
            assert_eq!(m.proxy_name, "web");
            assert_eq!(m.proxy_type, "http");
        }
        other => panic!("expected NewProxy, got {:?}", other),
    }

    send(
        &mut h.server,
        NewProxyResp {
            proxy_name: "web".to_string(),
            remote_addr: "web.example.com".to_string(),
            error: String::new(),
        },
    )
    .await;

    let pm = h.ctl.proxy_manager().clone();
    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(status) = pm.get_proxy_status("web").await {
                if status.phase == ProxyPhase::Running {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(status.remote_addr, "web.example.com");
}

#[tokio::test]
async fn test_work_connection_reaches_local_service() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        socket.write_all(&buf).await.unwrap();
    });

    let mut h = harness(quiet_common());
    h.ctl.run(&[tcp("echo", local_port, 16000)], &[]).await;
    assert!(matches!(recv(&mut h.server).await, Some(Message::NewProxy(_))));
    send(
        &mut h.server,
        NewProxyResp {
            proxy_name: "echo".to_string(),
            remote_addr: ":16000".to_string(),
            error: String::new(),
        },
    )
    .await;

    send(&mut h.server, ReqWorkConn {}).await;
    let mut work = h.work_rx.recv().await.unwrap();
    match recv(&mut work).await {
        Some(Message::NewWorkConn(m)) => assert_eq!(m.run_id, "run-1"),
        other => panic!("expected NewWorkConn, got {:?}", other),
    }
    send(
        &mut work,
        StartWorkConn {
            proxy_name: "echo".to_string(),
            src_addr: "198.51.100.1".to_string(),
            src_port: 40000,
            ..Default::default()
        },
    )
    .await;

    work.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), work.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_rejected_work_connection_is_dropped() {
    let mut h = harness(quiet_common());
    h.ctl.run(&[tcp("db", 5432, 15432)], &[]).await;
    let _ = recv(&mut h.server).await;

    send(&mut h.server, ReqWorkConn {}).await;
    let mut work = h.work_rx.recv().await.unwrap();
    let _ = recv(&mut work).await;
    send(
        &mut work,
        StartWorkConn {
            proxy_name: "db".to_string(),
            error: "quota exceeded".to_string(),
            ..Default::default()
        },
    )
    .await;

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), work.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert!(!h.ctl.is_done());
}

#[tokio::test]
async fn test_pong_error_ends_session() {
    let mut h = harness(quiet_common());
    h.ctl.run(&[http("web", 8080)], &[]).await;
    let _ = recv(&mut h.server).await;

    send(
        &mut h.server,
        Pong {
            error: "token expired".to_string(),
        },
    )
    .await;

    wait_done(&h.ctl).await;
    assert!(h.ctl.proxy_manager().get_all_proxy_status().await.is_empty());
    assert!(h.ctl.proxy_manager().is_closed().await);
}

#[tokio::test]
async fn test_server_disconnect_ends_session() {
    let mut h = harness(quiet_common());
    h.ctl.run(&[http("web", 8080)], &[]).await;
    let _ = recv(&mut h.server).await;

    drop(h.server);

    wait_done(&h.ctl).await;
    assert!(h.ctl.proxy_manager().get_all_proxy_status().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_ends_session() {
    let mut common = ClientCommonConfig::default();
    common.transport.heartbeat_interval_secs = 1;
    common.transport.heartbeat_timeout_secs = 3;

    let mut h = harness(common);
    h.ctl.run(&[], &[]).await;

    // One ping per tick, never answered
    let mut pings = 0;
    while let Ok(Some(msg)) = rtunnel_client::transport::read_message(&mut h.server).await {
        assert!(matches!(msg, Message::Ping(_)));
        pings += 1;
    }

    assert!(pings >= 2, "expected several pings, got {}", pings);
    assert!(h.ctl.is_done());
}

#[tokio::test(start_paused = true)]
async fn test_non_positive_heartbeat_timeout_keeps_session() {
    let mut common = ClientCommonConfig::default();
    common.transport.heartbeat_interval_secs = 1;
    common.transport.heartbeat_timeout_secs = -1;

    let mut h = harness(common);
    h.ctl.run(&[], &[]).await;

    for _ in 0..5 {
        let msg = rtunnel_client::transport::read_message(&mut h.server)
            .await
            .unwrap();
        assert!(matches!(msg, Some(Message::Ping(_))));
    }
    assert!(!h.ctl.is_done());

    h.ctl.close().await;
    assert!(h.ctl.is_done());
}

#[tokio::test]
async fn test_graceful_close_withdraws_proxies() {
    let mut h = harness(quiet_common());
    h.ctl
        .run(&[http("web", 8080), tcp("db", 5432, 15432)], &[])
        .await;
    let _ = recv(&mut h.server).await;
    let _ = recv(&mut h.server).await;

    h.ctl.graceful_close(Duration::from_millis(20)).await;
    assert!(h.ctl.is_done());

    let mut closed = Vec::new();
    while let Some(msg) = recv(&mut h.server).await {
        match msg {
            Message::CloseProxy(m) => closed.push(m.proxy_name),
            other => panic!("unexpected message {:?}", other),
        }
    }
    closed.sort();
    assert_eq!(closed, vec!["db", "web"]);
}

#[tokio::test]
async fn test_update_all_configurer_reconciles() {
    let mut h = harness(quiet_common());
    h.ctl.run(&[http("web", 8080)], &[]).await;
    let _ = recv(&mut h.server).await;

    h.ctl
        .update_all_configurer(&[http("web", 8080), tcp("db", 5432, 15432)], &[])
        .await;
    match recv(&mut h.server).await {
        Some(Message::NewProxy(m)) => assert_eq!(m.proxy_name, "db"),
        other => panic!("expected NewProxy for db, got {:?}", other),
    }

    h.ctl.update_all_configurer(&[tcp("db", 5432, 15432)], &[]).await;
    match recv(&mut h.server).await {
        Some(Message::CloseProxy(m)) => assert_eq!(m.proxy_name, "web"),
        other => panic!("expected CloseProxy for web, got {:?}", other),
    }
}
