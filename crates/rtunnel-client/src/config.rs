//! Client configuration
//!
//! Typed, already-validated settings consumed by the service: common client
//! settings, the declarative proxy list and the visitor list.

use crate::error::{ClientError, Result};
use rtunnel_proto::NewProxy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Full client configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub common: ClientCommonConfig,

    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub visitors: Vec<VisitorConfig>,

    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl ClientConfig {
    /// Load a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| ClientError::ConfigError(format!("invalid configuration: {}", e)))
    }
}

/// Settings shared by every proxy of this client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientCommonConfig {
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    #[serde(default)]
    pub user: String,

    /// Abort the run if the very first login fails
    #[serde(default = "default_true")]
    pub login_fail_exit: bool,

    #[serde(default)]
    pub metadatas: BTreeMap<String, String>,

    /// Name server used to resolve `server_addr`, as `ip` or `ip:port`.
    /// Empty means the system resolver.
    #[serde(default)]
    pub dns_server: String,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub web_server: WebServerConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl ClientCommonConfig {
    pub fn dns_server_addr(&self) -> Result<Option<SocketAddr>> {
        parse_dns_server(&self.dns_server)
    }
}

/// Parse `ip` or `ip:port` (port 53 by default); empty means unset
pub fn parse_dns_server(raw: &str) -> Result<Option<SocketAddr>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }
    raw.parse::<IpAddr>()
        .map(|ip| Some(SocketAddr::new(ip, 53)))
        .map_err(|_| ClientError::ConfigError(format!("invalid dns_server: {}", raw)))
}

fn default_server_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7000
}

fn default_true() -> bool {
    true
}

impl Default for ClientCommonConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            server_port: default_server_port(),
            user: String::new(),
            login_fail_exit: true,
            metadatas: BTreeMap::new(),
            dns_server: String::new(),
            auth: AuthConfig::default(),
            transport: TransportConfig::default(),
            web_server: WebServerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Token,
    None,
}

/// Messages that carry a privilege key besides the login
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthScope {
    HeartBeats,
    NewWorkConns,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(default)]
    pub method: AuthMethod,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub additional_scopes: Vec<AuthScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_dial_timeout")]
    pub dial_server_timeout_secs: u64,

    #[serde(default = "default_pool_count")]
    pub pool_count: u32,

    /// Seconds between heartbeats; zero or negative disables them
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: i64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: i64,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_pool_count() -> u32 {
    1
}

fn default_heartbeat_interval() -> i64 {
    30
}

fn default_heartbeat_timeout() -> i64 {
    90
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            dial_server_timeout_secs: default_dial_timeout(),
            pool_count: default_pool_count(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn dial_server_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_server_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0)
            .then(|| Duration::from_secs(self.heartbeat_interval_secs as u64))
    }

    /// `None` when the timeout check is disabled (zero or negative)
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_secs > 0)
            .then(|| Duration::from_secs(self.heartbeat_timeout_secs as u64))
    }
}

/// Admin HTTP surface; disabled when `port` is zero
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebServerConfig {
    #[serde(default = "default_web_addr")]
    pub addr: String,

    #[serde(default)]
    pub port: u16,
}

fn default_web_addr() -> String {
    "127.0.0.1".to_string()
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            addr: default_web_addr(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// "console" or a file path
    #[serde(default = "default_log_to")]
    pub to: String,

    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub disable_print_color: bool,
}

fn default_log_to() -> String {
    "console".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            to: default_log_to(),
            level: default_log_level(),
            disable_print_color: false,
        }
    }
}

/// Operator endpoint receiving proxy detail snapshots
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
}

/// Supported proxy kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Tcp,
    Http,
    Https,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Tcp => "tcp",
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ProxyKind::Tcp),
            "http" => Ok(ProxyKind::Http),
            "https" => Ok(ProxyKind::Https),
            _ => Err(ClientError::UnknownProxyType(s.to_string())),
        }
    }
}

/// Fields common to every proxy kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyBaseConfig {
    pub name: String,

    #[serde(default = "default_local_ip")]
    pub local_ip: String,

    #[serde(default)]
    pub local_port: u16,

    #[serde(default)]
    pub metadatas: BTreeMap<String, String>,
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

impl ProxyBaseConfig {
    pub fn new(name: impl Into<String>, local_ip: impl Into<String>, local_port: u16) -> Self {
        Self {
            name: name.into(),
            local_ip: local_ip.into(),
            local_port,
            metadatas: BTreeMap::new(),
        }
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,

    /// Zero lets the server pick a port
    #[serde(default)]
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,

    #[serde(default)]
    pub custom_domains: Vec<String>,

    #[serde(default)]
    pub subdomain: Option<String>,

    #[serde(default)]
    pub locations: Vec<String>,

    #[serde(default)]
    pub host_header_rewrite: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpsProxyConfig {
    #[serde(flatten)]
    pub base: ProxyBaseConfig,

    #[serde(default)]
    pub custom_domains: Vec<String>,

    #[serde(default)]
    pub subdomain: Option<String>,
}

/// One declarative proxy definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyConfig {
    Tcp(TcpProxyConfig),
    Http(HttpProxyConfig),
    Https(HttpsProxyConfig),
}

impl ProxyConfig {
    /// Build a configuration for an imperatively created proxy.
    ///
    /// `remote_port` only applies to TCP proxies; HTTP(S) proxies are routed by
    /// domain and ignore it.
    pub fn from_kind(
        kind: ProxyKind,
        name: &str,
        local_ip: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        let base = ProxyBaseConfig::new(name, local_ip, local_port);
        match kind {
            ProxyKind::Tcp => ProxyConfig::Tcp(TcpProxyConfig { base, remote_port }),
            ProxyKind::Http => ProxyConfig::Http(HttpProxyConfig {
                base,
                custom_domains: Vec::new(),
                subdomain: None,
                locations: Vec::new(),
                host_header_rewrite: None,
            }),
            ProxyKind::Https => ProxyConfig::Https(HttpsProxyConfig {
                base,
                custom_domains: Vec::new(),
                subdomain: None,
            }),
        }
    }

    pub fn kind(&self) -> ProxyKind {
        match self {
            ProxyConfig::Tcp(_) => ProxyKind::Tcp,
            ProxyConfig::Http(_) => ProxyKind::Http,
            ProxyConfig::Https(_) => ProxyKind::Https,
        }
    }

    pub fn base(&self) -> &ProxyBaseConfig {
        match self {
            ProxyConfig::Tcp(c) => &c.base,
            ProxyConfig::Http(c) => &c.base,
            ProxyConfig::Https(c) => &c.base,
        }
    }

    pub fn name(&self) -> &str {
        &self.base().name
    }

    /// Registration message announcing this proxy to the server
    pub fn to_new_proxy(&self) -> NewProxy {
        let base = self.base();
        let mut msg = NewProxy {
            proxy_name: base.name.clone(),
            proxy_type: self.kind().as_str().to_string(),
            metas: base.metadatas.clone(),
            ..Default::default()
        };
        match self {
            ProxyConfig::Tcp(c) => {
                msg.remote_port = c.remote_port;
            }
            ProxyConfig::Http(c) => {
                msg.custom_domains = c.custom_domains.clone();
                msg.subdomain = c.subdomain.clone().unwrap_or_default();
                msg.locations = c.locations.clone();
                msg.host_header_rewrite = c.host_header_rewrite.clone().unwrap_or_default();
            }
            ProxyConfig::Https(c) => {
                msg.custom_domains = c.custom_domains.clone();
                msg.subdomain = c.subdomain.clone().unwrap_or_default();
            }
        }
        msg
    }
}

/// Visitor definition; carried as desired state only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisitorConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub visitor_type: String,

    #[serde(default)]
    pub server_name: String,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default = "default_local_ip")]
    pub bind_addr: String,

    #[serde(default)]
    pub bind_port: u16,
}
