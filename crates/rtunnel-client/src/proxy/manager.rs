//! Registry of the proxies owned by one control session
//!
//! Every mutation and lookup goes through a single async reader/writer lock,
//! so a reconciliation pass is atomic with respect to status queries and
//! imperative creation.

use super::wrapper::{
    DefaultWrapperFactory, ProxyWrapper, WorkConnHandler, WrapperContext, WrapperFactory,
};
use crate::config::{ClientCommonConfig, ProxyConfig, ProxyKind};
use crate::error::{ClientError, Result};
use crate::event::{EventHandler, ProxyEvent, TransporterEventHandler};
use crate::status::{StatusExporter, WorkingDetail, WorkingStatus};
use crate::transport::{BoxConn, MessageTransporter};
use crate::webhook::WebhookNotifier;
use async_trait::async_trait;
use rtunnel_proto::{Message, StartWorkConn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ManagerState {
    proxies: HashMap<String, Arc<dyn ProxyWrapper>>,
    closed: bool,
}

pub struct ProxyManager {
    state: RwLock<ManagerState>,
    events: Arc<dyn EventHandler>,
    client_cfg: Arc<ClientCommonConfig>,
    webhook: Arc<dyn WebhookNotifier>,
    factory: Arc<dyn WrapperFactory>,
    work_conn_handler: Option<Arc<dyn WorkConnHandler>>,
}

impl ProxyManager {
    pub fn new(
        transporter: Arc<dyn MessageTransporter>,
        client_cfg: Arc<ClientCommonConfig>,
        webhook: Arc<dyn WebhookNotifier>,
    ) -> Self {
        Self {
            state: RwLock::new(ManagerState::default()),
            events: Arc::new(TransporterEventHandler::new(transporter)),
            client_cfg,
            webhook,
            factory: Arc::new(DefaultWrapperFactory),
            work_conn_handler: None,
        }
    }

    pub fn with_wrapper_factory(mut self, factory: Arc<dyn WrapperFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_work_conn_handler(mut self, handler: Option<Arc<dyn WorkConnHandler>>) -> Self {
        self.work_conn_handler = handler;
        self
    }

    fn new_wrapper(&self, cfg: ProxyConfig) -> Arc<dyn ProxyWrapper> {
        self.factory.create(
            cfg,
            WrapperContext {
                client_cfg: self.client_cfg.clone(),
                event_handler: self.events.clone(),
                work_conn_handler: self.work_conn_handler.clone(),
            },
        )
    }

    /// Reconcile the registry against the desired configuration.
    ///
    /// Entries that are gone or whose configuration changed are stopped and
    /// removed; unchanged entries keep their wrapper; new names are started.
    /// Duplicate names in `desired` resolve to the last occurrence.
    pub async fn update_all(&self, desired: &[ProxyConfig]) {
        let mut wanted: HashMap<&str, &ProxyConfig> = HashMap::with_capacity(desired.len());
        for cfg in desired {
            if wanted.insert(cfg.name(), cfg).is_some() {
                warn!(proxy = %cfg.name(), "duplicate proxy name in configuration, using the last one");
            }
        }

        let mut state = self.state.write().await;
        if state.closed {
            debug!("proxy manager closed, ignoring configuration update");
            return;
        }

        let stale: Vec<String> = state
            .proxies
            .iter()
            .filter(|(name, pxy)| {
                wanted
                    .get(name.as_str())
                    .map_or(true, |cfg| *cfg != pxy.config())
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &stale {
            if let Some(pxy) = state.proxies.remove(name) {
                pxy.stop().await;
            }
        }
        if !stale.is_empty() {
            info!("proxy removed: {:?}", stale);
        }

        let mut added = Vec::new();
        for cfg in desired {
            // Walk the input order; skip entries shadowed by a later duplicate.
            let is_winner = wanted
                .get(cfg.name())
                .is_some_and(|winner| std::ptr::eq(*winner, cfg));
            if !is_winner || state.proxies.contains_key(cfg.name()) {
                continue;
            }
            let pxy = self.new_wrapper(cfg.clone());
            state.proxies.insert(cfg.name().to_string(), pxy.clone());
            pxy.start().await;
            added.push(cfg.name().to_string());
        }
        if !added.is_empty() {
            info!("proxy added: {:?}", added);
        }
    }

    /// Create and start a single proxy outside of declarative reconciliation
    pub async fn create_proxy(
        &self,
        proxy_type: &str,
        name: &str,
        local_ip: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<()> {
        let kind: ProxyKind = proxy_type.parse()?;
        let cfg = ProxyConfig::from_kind(kind, name, local_ip, local_port, remote_port);

        let mut state = self.state.write().await;
        if state.closed {
            return Err(ClientError::ManagerClosed);
        }
        if state.proxies.contains_key(name) {
            return Err(ClientError::ProxyAlreadyExists(name.to_string()));
        }

        let pxy = self.new_wrapper(cfg);
        state.proxies.insert(name.to_string(), pxy.clone());
        pxy.start().await;
        info!(proxy = %name, proxy_type = %kind, "proxy created");
        Ok(())
    }

    /// Report whether `name` is registered, pushing its detail to the
    /// webhook when it is.
    pub async fn is_proxy_exist(&self, name: &str) -> bool {
        let state = self.state.read().await;
        match state.proxies.get(name) {
            Some(pxy) => {
                self.webhook.notify(pxy.detail());
                true
            }
            None => false,
        }
    }

    /// Apply the server's answer to a proxy registration
    pub async fn start_proxy(&self, name: &str, remote_addr: &str, server_resp_err: &str) -> Result<()> {
        let state = self.state.read().await;
        let pxy = state
            .proxies
            .get(name)
            .ok_or_else(|| ClientError::ProxyNotFound(name.to_string()))?;
        pxy.set_running_status(remote_addr, server_resp_err)
    }

    /// Route a work connection to its proxy, closing it when the proxy is unknown
    pub async fn handle_work_conn(&self, name: &str, mut conn: BoxConn, msg: StartWorkConn) {
        let pxy = self.state.read().await.proxies.get(name).cloned();
        match pxy {
            Some(pxy) => pxy.in_work_conn(conn, msg),
            None => {
                debug!(proxy = %name, "no proxy for work connection, closing it");
                let _ = conn.shutdown().await;
            }
        }
    }

    /// Forward a lifecycle event over the control connection
    pub async fn handle_event(&self, event: ProxyEvent) -> Result<()> {
        self.events.handle_event(event).await
    }

    /// Forward a lifecycle message; anything but `NewProxy` or `CloseProxy`
    /// is rejected.
    pub async fn handle_message(&self, msg: Message) -> Result<()> {
        self.handle_event(ProxyEvent::try_from(msg)?).await
    }

    /// Stop every proxy and refuse further additions
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        state.closed = true;
        let proxies: Vec<_> = state.proxies.drain().collect();
        for (name, pxy) in proxies {
            debug!(proxy = %name, "stopping proxy");
            pxy.stop().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    pub async fn get_all_proxy_status(&self) -> Vec<WorkingStatus> {
        let state = self.state.read().await;
        let mut statuses: Vec<_> = state.proxies.values().map(|pxy| pxy.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn get_proxy_status(&self, name: &str) -> Option<WorkingStatus> {
        self.state.read().await.proxies.get(name).map(|pxy| pxy.status())
    }

    pub async fn get_proxy_detail(&self, name: &str) -> Option<WorkingDetail> {
        self.state.read().await.proxies.get(name).map(|pxy| pxy.detail())
    }
}

#[async_trait]
impl StatusExporter for ProxyManager {
    async fn get_proxy_status(&self, name: &str) -> Option<WorkingStatus> {
        ProxyManager::get_proxy_status(self, name).await
    }
}
