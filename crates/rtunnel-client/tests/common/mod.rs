//! In-memory relay server and capability doubles shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use rtunnel_client::config::{ClientCommonConfig, ProxyConfig, ProxyKind};
use rtunnel_client::connector::{Connector, ConnectorFactory};
use rtunnel_client::error::{ClientError, Result};
use rtunnel_client::status::WorkingDetail;
use rtunnel_client::transport::{read_message, write_message, BoxConn, MessageTransporter};
use rtunnel_client::webhook::WebhookNotifier;
use rtunnel_proto::{Login, LoginResp, Message, NewWorkConn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Connector that hands the server side of each new pipe to a fake relay
pub struct DuplexConnector {
    server_tx: mpsc::UnboundedSender<DuplexStream>,
    fail_connects: Arc<AtomicUsize>,
}

impl DuplexConnector {
    pub fn new(server_tx: mpsc::UnboundedSender<DuplexStream>) -> Self {
        Self {
            server_tx,
            fail_connects: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self) -> Result<BoxConn> {
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(ClientError::ConnectionError("connection refused".to_string()));
        }
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.server_tx
            .send(server)
            .map_err(|_| ClientError::ConnectionError("relay is gone".to_string()))?;
        Ok(Box::new(client))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct DuplexConnectorFactory {
    server_tx: mpsc::UnboundedSender<DuplexStream>,
    fail_connects: Arc<AtomicUsize>,
}

impl DuplexConnectorFactory {
    /// Make the next `n` dials fail before reaching the relay
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }
}

impl ConnectorFactory for DuplexConnectorFactory {
    fn create(&self, _common: &ClientCommonConfig) -> Box<dyn Connector> {
        Box::new(DuplexConnector {
            server_tx: self.server_tx.clone(),
            fail_connects: self.fail_connects.clone(),
        })
    }
}

/// Test-side view of the fake relay
pub struct FakeRelay {
    pub logins: Arc<Mutex<Vec<Login>>>,
    pub controls: mpsc::UnboundedReceiver<DuplexStream>,
    pub work_conns: mpsc::UnboundedReceiver<(NewWorkConn, DuplexStream)>,
}

impl FakeRelay {
    pub fn logins(&self) -> Vec<Login> {
        self.logins.lock().unwrap().clone()
    }

    pub async fn next_control(&mut self) -> DuplexStream {
        tokio::time::timeout(Duration::from_secs(60), self.controls.recv())
            .await
            .expect("timed out waiting for a control connection")
            .expect("relay stopped")
    }

    pub async fn next_work_conn(&mut self) -> (NewWorkConn, DuplexStream) {
        tokio::time::timeout(Duration::from_secs(60), self.work_conns.recv())
            .await
            .expect("timed out waiting for a work connection")
            .expect("relay stopped")
    }
}

/// Start a relay that rejects the first `reject_logins` logins and then
/// accepts every login with `run_id`.
pub fn spawn_relay(reject_logins: usize, run_id: &str) -> (Arc<DuplexConnectorFactory>, FakeRelay) {
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<DuplexStream>();
    let (control_tx, controls) = mpsc::unbounded_channel();
    let (work_tx, work_conns) = mpsc::unbounded_channel();
    let logins = Arc::new(Mutex::new(Vec::new()));

    let relay_logins = logins.clone();
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        let mut rejections_left = reject_logins;
        while let Some(mut stream) = server_rx.recv().await {
            match read_message(&mut stream).await {
                Ok(Some(Message::Login(login))) => {
                    relay_logins.lock().unwrap().push(login);
                    if rejections_left > 0 {
                        rejections_left -= 1;
                        let resp = LoginResp {
                            error: "invalid token".to_string(),
                            ..Default::default()
                        };
                        let _ = write_message(&mut stream, &resp.into()).await;
                        continue;
                    }
                    let resp = LoginResp {
                        version: "test".to_string(),
                        run_id: run_id.clone(),
                        error: String::new(),
                    };
                    if write_message(&mut stream, &resp.into()).await.is_ok() {
                        let _ = control_tx.send(stream);
                    }
                }
                Ok(Some(Message::NewWorkConn(msg))) => {
                    let _ = work_tx.send((msg, stream));
                }
                _ => {}
            }
        }
    });

    (
        Arc::new(DuplexConnectorFactory {
            server_tx,
            fail_connects: Arc::new(AtomicUsize::new(0)),
        }),
        FakeRelay {
            logins,
            controls,
            work_conns,
        },
    )
}

/// Connector factory whose relay never answers; the test receives the
/// server side of every dialed pipe.
pub fn silent_relay() -> (
    Arc<DuplexConnectorFactory>,
    mpsc::UnboundedReceiver<DuplexStream>,
) {
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    (
        Arc::new(DuplexConnectorFactory {
            server_tx,
            fail_connects: Arc::new(AtomicUsize::new(0)),
        }),
        server_rx,
    )
}

/// Read the next message, skipping heartbeats
pub async fn recv(stream: &mut DuplexStream) -> Option<Message> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(60), read_message(stream))
            .await
            .expect("timed out waiting for a message")
            .expect("read failed");
        match msg {
            Some(Message::Ping(_)) => continue,
            other => return other,
        }
    }
}

pub async fn send(stream: &mut DuplexStream, msg: impl Into<Message>) {
    write_message(stream, &msg.into()).await.unwrap();
}

#[derive(Default)]
pub struct RecordingWebhook {
    pub details: Mutex<Vec<WorkingDetail>>,
}

impl RecordingWebhook {
    pub fn names(&self) -> Vec<String> {
        self.details
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }
}

impl WebhookNotifier for RecordingWebhook {
    fn notify(&self, detail: WorkingDetail) {
        self.details.lock().unwrap().push(detail);
    }
}

/// Transporter that discards everything
pub struct NullTransporter;

#[async_trait]
impl MessageTransporter for NullTransporter {
    async fn send(&self, _msg: Message) -> Result<()> {
        Ok(())
    }
}

pub fn tcp(name: &str, local_port: u16, remote_port: u16) -> ProxyConfig {
    ProxyConfig::from_kind(ProxyKind::Tcp, name, "127.0.0.1", local_port, remote_port)
}

pub fn http(name: &str, local_port: u16) -> ProxyConfig {
    ProxyConfig::from_kind(ProxyKind::Http, name, "127.0.0.1", local_port, 0)
}

/// Common settings with heartbeats off so paused-clock tests do not time out
pub fn quiet_common() -> ClientCommonConfig {
    let mut common = ClientCommonConfig::default();
    common.transport.heartbeat_interval_secs = 0;
    common.login_fail_exit = false;
    common
}
