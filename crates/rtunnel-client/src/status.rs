//! Read-only proxy snapshots handed out of the registry

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run phase of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyPhase {
    /// Created, not started yet
    New,
    /// Registration sent, waiting for the server's answer
    WaitStart,
    Running,
    /// The server refused the registration
    StartError,
    Closed,
}

impl ProxyPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyPhase::New => "new",
            ProxyPhase::WaitStart => "wait start",
            ProxyPhase::Running => "running",
            ProxyPhase::StartError => "start error",
            ProxyPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for ProxyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot of one proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub phase: ProxyPhase,
    pub err: String,
    /// Address assigned by the server once running
    pub remote_addr: String,
}

/// Local endpoint summary inside a detail snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub addr: String,
    pub inspect: bool,
}

/// Operator-facing detail snapshot of one proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingDetail {
    pub name: String,
    pub uri: String,
    pub public_url: String,
    #[serde(rename = "type")]
    pub proxy_type: String,
    pub status: String,
    pub config: ConfigInfo,
}

/// Narrow status lookup for operator surfaces
#[async_trait]
pub trait StatusExporter: Send + Sync {
    async fn get_proxy_status(&self, name: &str) -> Option<WorkingStatus>;
}
