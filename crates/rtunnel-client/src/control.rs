//! One logged-in session: the control connection, its heartbeat and the
//! proxy registry bound to it

use crate::auth::AuthSetter;
use crate::config::{ClientCommonConfig, ProxyConfig, VisitorConfig};
use crate::connector::Connector;
use crate::error::{ClientError, Result};
use crate::proxy::{ProxyManager, WorkConnHandler, WrapperFactory};
use crate::transport::{read_message, write_message, BoxConn, FramedTransporter, MessageTransporter};
use crate::webhook::WebhookNotifier;
use rtunnel_proto::{Message, NewWorkConn, Ping};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for the server to follow a work connection with `StartWorkConn`
pub const START_WORK_CONN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything negotiated or chosen for one session
#[derive(Clone)]
pub struct SessionContext {
    pub common: Arc<ClientCommonConfig>,
    pub run_id: String,
    pub conn_encrypted: bool,
    pub auth_setter: Arc<dyn AuthSetter>,
    pub connector: Arc<dyn Connector>,
    pub webhook: Arc<dyn WebhookNotifier>,
    pub wrapper_factory: Option<Arc<dyn WrapperFactory>>,
    pub work_conn_handler: Option<Arc<dyn WorkConnHandler>>,
}

pub struct Control {
    ctx: SessionContext,
    pm: Arc<ProxyManager>,
    transporter: Arc<FramedTransporter>,
    reader: tokio::sync::Mutex<Option<ReadHalf<BoxConn>>>,
    accepting_work: AtomicBool,
    closing: AtomicBool,
    last_pong: Mutex<Instant>,
    done: CancellationToken,
}

impl Control {
    /// Wrap an already logged-in control connection
    pub fn new(ctx: SessionContext, conn: BoxConn) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(conn);
        let transporter = Arc::new(FramedTransporter::new(writer));

        let mut pm = ProxyManager::new(
            transporter.clone() as Arc<dyn MessageTransporter>,
            ctx.common.clone(),
            ctx.webhook.clone(),
        )
        .with_work_conn_handler(ctx.work_conn_handler.clone());
        if let Some(factory) = &ctx.wrapper_factory {
            pm = pm.with_wrapper_factory(factory.clone());
        }

        Arc::new(Self {
            ctx,
            pm: Arc::new(pm),
            transporter,
            reader: tokio::sync::Mutex::new(Some(reader)),
            accepting_work: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            last_pong: Mutex::new(Instant::now()),
            done: CancellationToken::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.ctx.run_id
    }

    pub fn is_encrypted(&self) -> bool {
        self.ctx.conn_encrypted
    }

    pub fn proxy_manager(&self) -> &Arc<ProxyManager> {
        &self.pm
    }

    /// Register the desired proxies and start the reader and heartbeat tasks
    pub async fn run(self: &Arc<Self>, proxies: &[ProxyConfig], visitors: &[VisitorConfig]) {
        self.pm.update_all(proxies).await;
        if !visitors.is_empty() {
            debug!(run_id = %self.ctx.run_id, "{} visitor(s) configured", visitors.len());
        }

        match self.reader.lock().await.take() {
            Some(reader) => {
                tokio::spawn(self.clone().read_loop(reader));
            }
            None => {
                warn!(run_id = %self.ctx.run_id, "control already running");
                return;
            }
        }

        if let Some(interval) = self.ctx.common.transport.heartbeat_interval() {
            let timeout = self.ctx.common.transport.heartbeat_timeout();
            tokio::spawn(self.clone().heartbeat_loop(interval, timeout));
        }
    }

    /// Reconcile the session's proxies against a new desired configuration
    pub async fn update_all_configurer(&self, proxies: &[ProxyConfig], visitors: &[VisitorConfig]) {
        self.pm.update_all(proxies).await;
        debug!(run_id = %self.ctx.run_id, "{} visitor(s) configured", visitors.len());
    }

    /// Resolves once the session has ended for any reason
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Tear the session down immediately
    pub async fn close(&self) {
        self.graceful_close(Duration::ZERO).await
    }

    /// Stop taking work connections, let in-flight ones drain for `grace`,
    /// then tear the session down.
    pub async fn graceful_close(&self, grace: Duration) {
        self.accepting_work.store(false, Ordering::SeqCst);
        if !grace.is_zero() {
            debug!(run_id = %self.ctx.run_id, "draining for {:?}", grace);
            tokio::select! {
                _ = self.done.cancelled() => {}
                _ = tokio::time::sleep(grace) => {}
            }
        }
        self.shutdown(false).await;
    }

    async fn shutdown(&self, conn_lost: bool) {
        if self.closing.swap(true, Ordering::SeqCst) {
            self.done.cancelled().await;
            return;
        }
        self.accepting_work.store(false, Ordering::SeqCst);

        if conn_lost {
            self.transporter.close().await;
            self.pm.close().await;
        } else {
            // Proxies announce their removal while the connection is still up
            self.pm.close().await;
            self.transporter.close().await;
        }
        if let Err(e) = self.ctx.connector.close().await {
            debug!("error closing connector: {}", e);
        }

        self.done.cancel();
        info!(run_id = %self.ctx.run_id, "control closed");
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<BoxConn>) {
        loop {
            let result = tokio::select! {
                _ = self.done.cancelled() => return,
                result = read_message(&mut reader) => result,
            };

            match result {
                Ok(Some(msg)) => {
                    if !self.dispatch(msg).await {
                        break;
                    }
                }
                Ok(None) => {
                    info!(run_id = %self.ctx.run_id, "control connection closed by server");
                    break;
                }
                Err(e) => {
                    warn!(run_id = %self.ctx.run_id, "control connection read error: {}", e);
                    break;
                }
            }
        }
        self.shutdown(true).await;
    }

    /// Handle one inbound message; `false` ends the session
    async fn dispatch(self: &Arc<Self>, msg: Message) -> bool {
        match msg {
            Message::NewProxyResp(resp) => {
                match self
                    .pm
                    .start_proxy(&resp.proxy_name, &resp.remote_addr, &resp.error)
                    .await
                {
                    Ok(()) => info!(
                        proxy = %resp.proxy_name,
                        remote_addr = %resp.remote_addr,
                        "start proxy success"
                    ),
                    Err(e) if e.is_not_found() => {
                        debug!(proxy = %resp.proxy_name, "response for unknown proxy")
                    }
                    Err(e) => warn!(proxy = %resp.proxy_name, "{}", e),
                }
            }
            Message::ReqWorkConn(_) => {
                if !self.accepting_work.load(Ordering::SeqCst) {
                    debug!("closing, ignoring work connection request");
                } else {
                    let ctl = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = ctl.open_work_conn().await {
                            warn!(run_id = %ctl.ctx.run_id, "work connection failed: {}", e);
                        }
                    });
                }
            }
            Message::Pong(pong) => {
                if !pong.error.is_empty() {
                    error!(run_id = %self.ctx.run_id, "pong contains error: {}", pong.error);
                    return false;
                }
                *self.last_pong.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
                debug!("receive heartbeat from server");
            }
            other => {
                warn!("unexpected message on control connection: {}", other.kind());
            }
        }
        true
    }

    async fn open_work_conn(&self) -> Result<()> {
        let mut conn = self.ctx.connector.connect().await?;

        let mut msg = NewWorkConn {
            run_id: self.ctx.run_id.clone(),
            ..Default::default()
        };
        self.ctx.auth_setter.set_new_work_conn(&mut msg)?;
        write_message(&mut conn, &Message::from(msg)).await?;

        let start = tokio::time::timeout(START_WORK_CONN_TIMEOUT, read_message(&mut conn))
            .await
            .map_err(|_| ClientError::Timeout("waiting for StartWorkConn".to_string()))??;
        let start = match start {
            Some(Message::StartWorkConn(start)) => start,
            Some(other) => {
                return Err(ClientError::ProtocolError(format!(
                    "expected StartWorkConn, got {}",
                    other.kind()
                )))
            }
            None => {
                return Err(ClientError::ConnectionError(
                    "work connection closed before StartWorkConn".to_string(),
                ))
            }
        };
        if !start.error.is_empty() {
            return Err(ClientError::ProtocolError(format!(
                "StartWorkConn contains error: {}",
                start.error
            )));
        }

        let name = start.proxy_name.clone();
        self.pm.handle_work_conn(&name, conn, start).await;
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, interval: Duration, timeout: Option<Duration>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Some(timeout) = timeout {
                let since_pong = self
                    .last_pong
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .elapsed();
                if since_pong > timeout {
                    warn!(run_id = %self.ctx.run_id, "heartbeat timeout after {:?}", since_pong);
                    break;
                }
            }

            let mut ping = Ping::default();
            if let Err(e) = self.ctx.auth_setter.set_ping(&mut ping) {
                warn!("failed to authenticate heartbeat: {}", e);
                continue;
            }
            debug!("send heartbeat to server");
            if let Err(e) = self.transporter.send(ping.into()).await {
                warn!(run_id = %self.ctx.run_id, "send heartbeat error: {}", e);
                break;
            }
        }
        self.shutdown(true).await;
    }
}
