//! Client lifetime: first login, reconnect supervision and the active
//! control session

use crate::admin;
use crate::auth::{new_auth_setter, AuthSetter};
use crate::backoff::{backoff_until, FastBackoff, FastBackoffOptions};
use crate::config::{ClientCommonConfig, ClientConfig, ProxyConfig, VisitorConfig};
use crate::connector::{Connector, ConnectorFactory, DefaultConnectorFactory};
use crate::control::{Control, SessionContext};
use crate::error::{ClientError, Result};
use crate::proxy::{WorkConnHandler, WrapperFactory};
use crate::status::{StatusExporter, WorkingDetail, WorkingStatus};
use crate::transport::{read_message, write_message, BoxConn};
use crate::webhook::{HttpWebhook, WebhookNotifier};
use async_trait::async_trait;
use rtunnel_proto::{Login, Message};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on waiting for the server's answer to a login
pub const LOGIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff ceiling while waiting for the first successful login
pub const FIRST_LOGIN_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff ceiling while re-establishing a lost session
pub const RECONNECT_MAX_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    LoggingIn,
    Connected,
    Disconnected,
    Closing,
    Closed,
}

/// Inputs for building a [`Service`]
pub struct ServiceOptions {
    pub common: ClientCommonConfig,
    pub proxy_cfgs: Vec<ProxyConfig>,
    pub visitor_cfgs: Vec<VisitorConfig>,
    pub webhook: Arc<dyn WebhookNotifier>,
    pub connector_factory: Arc<dyn ConnectorFactory>,
    pub wrapper_factory: Option<Arc<dyn WrapperFactory>>,
    pub work_conn_handler: Option<Arc<dyn WorkConnHandler>>,
    /// Overrides the setter derived from `common.auth`
    pub auth_setter: Option<Arc<dyn AuthSetter>>,
}

impl ServiceOptions {
    pub fn new(config: ClientConfig) -> Self {
        let webhook = Arc::new(HttpWebhook::new(&config.webhook));
        Self {
            common: config.common,
            proxy_cfgs: config.proxies,
            visitor_cfgs: config.visitors,
            webhook,
            connector_factory: Arc::new(DefaultConnectorFactory),
            wrapper_factory: None,
            work_conn_handler: None,
            auth_setter: None,
        }
    }

    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookNotifier>) -> Self {
        self.webhook = webhook;
        self
    }

    pub fn with_connector_factory(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.connector_factory = factory;
        self
    }

    pub fn with_wrapper_factory(mut self, factory: Arc<dyn WrapperFactory>) -> Self {
        self.wrapper_factory = Some(factory);
        self
    }

    pub fn with_work_conn_handler(mut self, handler: Arc<dyn WorkConnHandler>) -> Self {
        self.work_conn_handler = Some(handler);
        self
    }
}

#[derive(Clone, Default)]
struct DesiredConfig {
    proxies: Vec<ProxyConfig>,
    visitors: Vec<VisitorConfig>,
}

pub struct Service {
    common: Arc<ClientCommonConfig>,
    auth_setter: Arc<dyn AuthSetter>,
    connector_factory: Arc<dyn ConnectorFactory>,
    webhook: Arc<dyn WebhookNotifier>,
    wrapper_factory: Option<Arc<dyn WrapperFactory>>,
    work_conn_handler: Option<Arc<dyn WorkConnHandler>>,

    ctl: RwLock<Option<Arc<Control>>>,
    cfg: RwLock<DesiredConfig>,
    run_id: Mutex<String>,

    cancel: CancellationToken,
    cancel_cause: Mutex<Option<String>>,
    graceful_close_duration: Mutex<Duration>,
    state: watch::Sender<RunState>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Service {
    pub fn new(options: ServiceOptions) -> Arc<Self> {
        let auth_setter = options
            .auth_setter
            .unwrap_or_else(|| new_auth_setter(&options.common.auth));
        let (state, _) = watch::channel(RunState::Idle);

        Arc::new(Self {
            common: Arc::new(options.common),
            auth_setter,
            connector_factory: options.connector_factory,
            webhook: options.webhook,
            wrapper_factory: options.wrapper_factory,
            work_conn_handler: options.work_conn_handler,
            ctl: RwLock::new(None),
            cfg: RwLock::new(DesiredConfig {
                proxies: options.proxy_cfgs,
                visitors: options.visitor_cfgs,
            }),
            run_id: Mutex::new(String::new()),
            cancel: CancellationToken::new(),
            cancel_cause: Mutex::new(None),
            graceful_close_duration: Mutex::new(Duration::ZERO),
            state,
        })
    }

    /// Log in, keep the session alive and return once the service is closed.
    ///
    /// Fails only when the first login fails with `login_fail_exit` set.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        if self.common.web_server.port > 0 {
            let addr = format!(
                "{}:{}",
                self.common.web_server.addr, self.common.web_server.port
            );
            let svc = self.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = admin::serve(svc, &addr, cancel).await {
                    error!("admin server error: {}", e);
                }
            });
        }

        self.set_state(RunState::LoggingIn);
        self.login_until_success(FIRST_LOGIN_MAX_INTERVAL, self.common.login_fail_exit)
            .await;

        if self.ctl.read().await.is_none() {
            self.set_state(RunState::Closed);
            return self.run_result();
        }

        let svc = self.clone();
        tokio::spawn(async move { svc.keep_controller_working().await });

        self.cancel.cancelled().await;
        self.stop().await;
        self.run_result()
    }

    fn run_result(&self) -> Result<()> {
        let cause = locked(&self.cancel_cause).clone();
        match cause {
            Some(cause) => Err(ClientError::LoginFailed(cause)),
            None => Ok(()),
        }
    }

    async fn keep_controller_working(self: Arc<Self>) {
        self.wait_control_done().await;

        let mut backoff = FastBackoff::new(FastBackoffOptions {
            duration: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            max_duration: RECONNECT_MAX_INTERVAL,
            fast_retry_count: 3,
            fast_retry_delay: Duration::from_millis(200),
            fast_retry_window: Duration::from_secs(60),
            fast_retry_jitter: 0.5,
            ..Default::default()
        });

        backoff_until(
            || {
                let svc = self.clone();
                async move {
                    if svc.cancel.is_cancelled() {
                        return Ok(true);
                    }
                    svc.set_state(RunState::Disconnected);
                    warn!("control connection lost, reconnecting");

                    svc.login_until_success(RECONNECT_MAX_INTERVAL, false).await;
                    if svc.cancel.is_cancelled() {
                        return Ok(true);
                    }

                    svc.wait_control_done().await;
                    Err(ClientError::ConnectionError(
                        "control is closed, trying another loop".to_string(),
                    ))
                }
            },
            &mut backoff,
            true,
            &self.cancel,
        )
        .await;
        debug!("reconnect supervisor exited");
    }

    async fn wait_control_done(&self) {
        let ctl = self.ctl.read().await.clone();
        if let Some(ctl) = ctl {
            tokio::select! {
                _ = ctl.done() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    async fn login_until_success(self: &Arc<Self>, max_interval: Duration, first_login_exit: bool) {
        let mut backoff = FastBackoff::new(FastBackoffOptions {
            duration: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.1,
            max_duration: max_interval,
            ..Default::default()
        });

        backoff_until(
            || {
                let svc = self.clone();
                async move { svc.login_attempt(first_login_exit).await }
            },
            &mut backoff,
            true,
            &self.cancel,
        )
        .await;
    }

    async fn login_attempt(&self, first_login_exit: bool) -> Result<bool> {
        info!(server = %format!("{}:{}", self.common.server_addr, self.common.server_port), "try to connect to server...");
        self.set_state(RunState::LoggingIn);

        let login = tokio::select! {
            res = self.login() => res,
            _ = self.cancel.cancelled() => {
                debug!("service closing, login abandoned");
                return Ok(true);
            }
        };
        let (conn, connector) = match login {
            Ok(session) => session,
            Err(e) => {
                warn!("connect to server error: {}", e);
                if first_login_exit {
                    self.cancel_with_cause(e.to_string());
                }
                return Err(e);
            }
        };

        // Holding the control lock across the desired-state read keeps a
        // concurrent update from being applied to the control being replaced.
        let mut active = self.ctl.write().await;
        if self.cancel.is_cancelled() {
            debug!("service closing, discarding new session");
            let _ = connector.close().await;
            return Ok(true);
        }

        let cfg = self.cfg.read().await.clone();
        let ctl = Control::new(
            SessionContext {
                common: self.common.clone(),
                run_id: self.run_id(),
                conn_encrypted: connector.is_encrypted(),
                auth_setter: self.auth_setter.clone(),
                connector,
                webhook: self.webhook.clone(),
                wrapper_factory: self.wrapper_factory.clone(),
                work_conn_handler: self.work_conn_handler.clone(),
            },
            conn,
        );
        ctl.run(&cfg.proxies, &cfg.visitors).await;

        if let Some(old) = active.replace(ctl) {
            old.close().await;
        }
        drop(active);

        self.set_state(RunState::Connected);
        Ok(true)
    }

    /// Open a connection and perform the login exchange
    async fn login(&self) -> Result<(BoxConn, Arc<dyn Connector>)> {
        let mut connector = self.connector_factory.create(&self.common);
        connector.open().await?;
        let connector: Arc<dyn Connector> = Arc::from(connector);

        match self.exchange_login(connector.as_ref()).await {
            Ok(conn) => Ok((conn, connector)),
            Err(e) => {
                if let Err(close_err) = connector.close().await {
                    debug!("error closing connector: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn exchange_login(&self, connector: &dyn Connector) -> Result<BoxConn> {
        let mut conn = connector.connect().await?;

        let mut login = Login {
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            pool_count: self.common.transport.pool_count,
            user: self.common.user.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            run_id: self.run_id(),
            metas: self.common.metadatas.clone(),
            ..Default::default()
        };
        self.auth_setter.set_login(&mut login)?;
        write_message(&mut conn, &Message::from(login)).await?;

        let resp = tokio::time::timeout(LOGIN_RESPONSE_TIMEOUT, read_message(&mut conn))
            .await
            .map_err(|_| ClientError::Timeout("waiting for login response".to_string()))??;
        let resp = match resp {
            Some(Message::LoginResp(resp)) => resp,
            Some(other) => {
                return Err(ClientError::ProtocolError(format!(
                    "expected LoginResp, got {}",
                    other.kind()
                )))
            }
            None => {
                return Err(ClientError::ConnectionError(
                    "server closed the connection during login".to_string(),
                ))
            }
        };

        if !resp.error.is_empty() {
            error!("login to server failed: {}", resp.error);
            return Err(ClientError::LoginRejected(resp.error));
        }

        *locked(&self.run_id) = resp.run_id.clone();
        info!(run_id = %resp.run_id, "login to server success, get run id [{}]", resp.run_id);
        Ok(conn)
    }

    /// Replace the desired configuration and reconcile the active session, if any
    pub async fn update_all_configurer(
        &self,
        proxy_cfgs: Vec<ProxyConfig>,
        visitor_cfgs: Vec<VisitorConfig>,
    ) -> Result<()> {
        {
            let mut cfg = self.cfg.write().await;
            cfg.proxies = proxy_cfgs.clone();
            cfg.visitors = visitor_cfgs.clone();
        }

        let ctl = self.ctl.read().await.clone();
        if let Some(ctl) = ctl {
            ctl.update_all_configurer(&proxy_cfgs, &visitor_cfgs).await;
        }
        Ok(())
    }

    /// Stop the service, letting in-flight work connections drain for `grace`
    pub fn graceful_close(&self, grace: Duration) {
        *locked(&self.graceful_close_duration) = grace;
        self.cancel.cancel();
    }

    pub fn close(&self) {
        self.graceful_close(Duration::ZERO)
    }

    fn cancel_with_cause(&self, cause: String) {
        *locked(&self.cancel_cause) = Some(cause);
        self.cancel.cancel();
    }

    async fn stop(&self) {
        self.set_state(RunState::Closing);
        let grace = *locked(&self.graceful_close_duration);
        let ctl = self.ctl.write().await.take();
        if let Some(ctl) = ctl {
            ctl.graceful_close(grace).await;
        }
        self.set_state(RunState::Closed);
    }

    /// Create a single proxy on the active session
    pub async fn create_proxy(
        &self,
        proxy_type: &str,
        name: &str,
        local_ip: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<()> {
        debug!(
            proxy_type, name, local_ip, local_port, remote_port,
            "create proxy requested"
        );
        let ctl = self.active_control().await.ok_or(ClientError::NotConnected)?;
        let pm = ctl.proxy_manager();
        if pm.is_proxy_exist(name).await {
            return Err(ClientError::ProxyAlreadyExists(name.to_string()));
        }
        pm.create_proxy(proxy_type, name, local_ip, local_port, remote_port)
            .await
    }

    /// Look up a proxy's detail, pushing it to the webhook when found
    pub async fn get_proxy_detail(&self, name: &str) -> Option<WorkingDetail> {
        let ctl = self.active_control().await?;
        let detail = ctl.proxy_manager().get_proxy_detail(name).await?;
        self.webhook.notify(detail.clone());
        Some(detail)
    }

    pub async fn is_proxy_exist(&self, name: &str) -> bool {
        match self.active_control().await {
            Some(ctl) => ctl.proxy_manager().is_proxy_exist(name).await,
            None => false,
        }
    }

    pub async fn get_all_proxy_status(&self) -> Vec<WorkingStatus> {
        match self.active_control().await {
            Some(ctl) => ctl.proxy_manager().get_all_proxy_status().await,
            None => Vec::new(),
        }
    }

    /// Narrow read-only view for operator surfaces
    pub fn status_exporter(self: &Arc<Self>) -> Arc<dyn StatusExporter> {
        Arc::new(ServiceStatusExporter {
            service: self.clone(),
        })
    }

    async fn active_control(&self) -> Option<Arc<Control>> {
        self.ctl.read().await.clone()
    }

    pub fn run_id(&self) -> String {
        locked(&self.run_id).clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RunState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("run state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }
}

struct ServiceStatusExporter {
    service: Arc<Service>,
}

#[async_trait]
impl StatusExporter for ServiceStatusExporter {
    async fn get_proxy_status(&self, name: &str) -> Option<WorkingStatus> {
        let ctl = self.service.active_control().await?;
        ctl.proxy_manager().get_proxy_status(name).await
    }
}
