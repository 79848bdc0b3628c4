//! Proxy lifecycle events and their delivery to the server

use crate::error::{ClientError, Result};
use crate::transport::MessageTransporter;
use async_trait::async_trait;
use rtunnel_proto::{CloseProxy, Message, NewProxy};
use std::sync::Arc;

/// Lifecycle transition of a proxy that the server must learn about
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    StartProxy(NewProxy),
    CloseProxy(CloseProxy),
}

impl ProxyEvent {
    pub fn proxy_name(&self) -> &str {
        match self {
            ProxyEvent::StartProxy(m) => &m.proxy_name,
            ProxyEvent::CloseProxy(m) => &m.proxy_name,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            ProxyEvent::StartProxy(m) => Message::NewProxy(m),
            ProxyEvent::CloseProxy(m) => Message::CloseProxy(m),
        }
    }
}

impl TryFrom<Message> for ProxyEvent {
    type Error = ClientError;

    fn try_from(msg: Message) -> Result<Self> {
        match msg {
            Message::NewProxy(m) => Ok(ProxyEvent::StartProxy(m)),
            Message::CloseProxy(m) => Ok(ProxyEvent::CloseProxy(m)),
            other => Err(ClientError::InvalidPayloadType(other.kind())),
        }
    }
}

/// Receives proxy lifecycle events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: ProxyEvent) -> Result<()>;
}

/// Forwards each event's message over the control connection
pub struct TransporterEventHandler {
    transporter: Arc<dyn MessageTransporter>,
}

impl TransporterEventHandler {
    pub fn new(transporter: Arc<dyn MessageTransporter>) -> Self {
        Self { transporter }
    }
}

#[async_trait]
impl EventHandler for TransporterEventHandler {
    async fn handle_event(&self, event: ProxyEvent) -> Result<()> {
        self.transporter.send(event.into_message()).await
    }
}
