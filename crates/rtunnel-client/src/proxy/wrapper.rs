//! Run state of a single proxy

use crate::config::{ClientCommonConfig, ProxyConfig};
use crate::error::{ClientError, Result};
use crate::event::{EventHandler, ProxyEvent};
use crate::status::{ConfigInfo, ProxyPhase, WorkingDetail, WorkingStatus};
use crate::transport::BoxConn;
use async_trait::async_trait;
use rtunnel_proto::{CloseProxy, StartWorkConn};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One configured proxy's lifecycle.
///
/// `start` must be called at most once; `stop` may be called from any phase.
#[async_trait]
pub trait ProxyWrapper: Send + Sync {
    fn config(&self) -> &ProxyConfig;

    /// Announce the proxy to the server
    async fn start(&self);

    /// Withdraw the proxy and release its resources
    async fn stop(&self);

    /// Apply the server's answer to the registration
    fn set_running_status(&self, remote_addr: &str, server_resp_err: &str) -> Result<()>;

    fn status(&self) -> WorkingStatus;

    fn detail(&self) -> WorkingDetail;

    /// Take ownership of a fresh work connection; never blocks
    fn in_work_conn(&self, conn: BoxConn, msg: StartWorkConn);
}

/// Hook that sees work connections before the default local bridging
pub trait WorkConnHandler: Send + Sync {
    /// Return the connection to fall through to default handling, or `None`
    /// once it has been consumed.
    fn handle_work_conn(
        &self,
        cfg: &ProxyConfig,
        conn: BoxConn,
        msg: &StartWorkConn,
    ) -> Option<BoxConn>;
}

/// Collaborators every wrapper is built with
#[derive(Clone)]
pub struct WrapperContext {
    pub client_cfg: Arc<ClientCommonConfig>,
    pub event_handler: Arc<dyn EventHandler>,
    pub work_conn_handler: Option<Arc<dyn WorkConnHandler>>,
}

/// Builds wrappers for the proxy manager
pub trait WrapperFactory: Send + Sync {
    fn create(&self, cfg: ProxyConfig, ctx: WrapperContext) -> Arc<dyn ProxyWrapper>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultWrapperFactory;

impl WrapperFactory for DefaultWrapperFactory {
    fn create(&self, cfg: ProxyConfig, ctx: WrapperContext) -> Arc<dyn ProxyWrapper> {
        Arc::new(Wrapper::new(cfg, ctx))
    }
}

struct WrapperState {
    phase: ProxyPhase,
    err: String,
    remote_addr: String,
}

/// Default wrapper: registers with the server and bridges work connections
/// to the local endpoint.
pub struct Wrapper {
    cfg: ProxyConfig,
    ctx: WrapperContext,
    state: Mutex<WrapperState>,
    shutdown: CancellationToken,
}

impl Wrapper {
    pub fn new(cfg: ProxyConfig, ctx: WrapperContext) -> Self {
        Self {
            cfg,
            ctx,
            state: Mutex::new(WrapperState {
                phase: ProxyPhase::New,
                err: String::new(),
                remote_addr: String::new(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, WrapperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> ProxyPhase {
        self.state().phase
    }

    async fn emit(&self, event: ProxyEvent) {
        match self.ctx.event_handler.handle_event(event).await {
            Ok(()) => {}
            Err(ClientError::TransportClosed) => {
                debug!(proxy = %self.cfg.name(), "control connection gone, event not sent");
            }
            Err(e) => warn!(proxy = %self.cfg.name(), "failed to send proxy event: {}", e),
        }
    }

    fn public_url(&self, remote_addr: &str) -> String {
        if remote_addr.is_empty() {
            return String::new();
        }
        if remote_addr.contains("://") {
            return remote_addr.to_string();
        }
        let scheme = self.cfg.kind().as_str();
        if remote_addr.starts_with(':') {
            format!(
                "{}://{}{}",
                scheme, self.ctx.client_cfg.server_addr, remote_addr
            )
        } else {
            format!("{}://{}", scheme, remote_addr)
        }
    }
}

#[async_trait]
impl ProxyWrapper for Wrapper {
    fn config(&self) -> &ProxyConfig {
        &self.cfg
    }

    async fn start(&self) {
        {
            let mut state = self.state();
            if state.phase != ProxyPhase::New {
                warn!(proxy = %self.cfg.name(), phase = %state.phase, "proxy already started");
                return;
            }
            state.phase = ProxyPhase::WaitStart;
        }
        debug!(proxy = %self.cfg.name(), "registering proxy");
        self.emit(ProxyEvent::StartProxy(self.cfg.to_new_proxy()))
            .await;
    }

    async fn stop(&self) {
        {
            let mut state = self.state();
            if state.phase == ProxyPhase::Closed {
                return;
            }
            state.phase = ProxyPhase::Closed;
        }
        self.shutdown.cancel();
        self.emit(ProxyEvent::CloseProxy(CloseProxy {
            proxy_name: self.cfg.name().to_string(),
        }))
        .await;
    }

    fn set_running_status(&self, remote_addr: &str, server_resp_err: &str) -> Result<()> {
        let mut state = self.state();
        if state.phase != ProxyPhase::WaitStart {
            return Err(ClientError::InvalidPhase {
                name: self.cfg.name().to_string(),
                phase: state.phase.as_str(),
                expected: ProxyPhase::WaitStart.as_str(),
            });
        }

        state.remote_addr = remote_addr.to_string();
        if !server_resp_err.is_empty() {
            state.phase = ProxyPhase::StartError;
            state.err = server_resp_err.to_string();
            return Err(ClientError::ProxyStartRejected {
                name: self.cfg.name().to_string(),
                reason: server_resp_err.to_string(),
            });
        }

        state.phase = ProxyPhase::Running;
        state.err.clear();
        info!(proxy = %self.cfg.name(), remote_addr = %remote_addr, "proxy running");
        Ok(())
    }

    fn status(&self) -> WorkingStatus {
        let state = self.state();
        WorkingStatus {
            name: self.cfg.name().to_string(),
            proxy_type: self.cfg.kind().to_string(),
            phase: state.phase,
            err: state.err.clone(),
            remote_addr: state.remote_addr.clone(),
        }
    }

    fn detail(&self) -> WorkingDetail {
        let (phase, remote_addr) = {
            let state = self.state();
            (state.phase, state.remote_addr.clone())
        };
        WorkingDetail {
            name: self.cfg.name().to_string(),
            uri: format!("/api/tunnels/{}", self.cfg.name()),
            public_url: self.public_url(&remote_addr),
            proxy_type: self.cfg.kind().to_string(),
            status: phase.to_string(),
            config: ConfigInfo {
                addr: self.cfg.base().local_addr(),
                inspect: false,
            },
        }
    }

    fn in_work_conn(&self, conn: BoxConn, msg: StartWorkConn) {
        let phase = self.phase();
        if phase != ProxyPhase::Running {
            debug!(proxy = %self.cfg.name(), %phase, "dropping work connection");
            return;
        }

        let conn = match &self.ctx.work_conn_handler {
            Some(handler) => match handler.handle_work_conn(&self.cfg, conn, &msg) {
                Some(conn) => conn,
                None => return,
            },
            None => conn,
        };

        let name = self.cfg.name().to_string();
        let local_addr = self.cfg.base().local_addr();
        let shutdown = self.shutdown.clone();
        debug!(
            proxy = %name,
            src = %format!("{}:{}", msg.src_addr, msg.src_port),
            "bridging work connection to {}", local_addr
        );
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(proxy = %name, "proxy stopped, closing work connection");
                }
                result = bridge(conn, &local_addr) => match result {
                    Ok((to_local, to_remote)) => debug!(
                        proxy = %name,
                        to_local, to_remote, "work connection finished"
                    ),
                    Err(e) => warn!(proxy = %name, "work connection error: {}", e),
                },
            }
        });
    }
}

/// Copy bytes both ways between a work connection and the local service
async fn bridge(mut conn: BoxConn, local_addr: &str) -> Result<(u64, u64)> {
    let mut local = TcpStream::connect(local_addr).await.map_err(|e| {
        ClientError::ConnectionError(format!("connect to local service {}: {}", local_addr, e))
    })?;
    Ok(tokio::io::copy_bidirectional(&mut conn, &mut local).await?)
}
