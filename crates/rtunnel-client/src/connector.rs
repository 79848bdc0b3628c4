//! Transport-level connections to the relay server

use crate::config::{parse_dns_server, ClientCommonConfig};
use crate::error::{ClientError, Result};
use crate::transport::BoxConn;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Opens connections to the relay server.
///
/// A connector is created per login attempt; the control connection and every
/// work connection of that session come from the same connector.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Prepare the underlying session (e.g. a multiplexed or encrypted link)
    async fn open(&mut self) -> Result<()>;

    /// Open a new logical connection
    async fn connect(&self) -> Result<BoxConn>;

    /// Release the underlying session
    async fn close(&self) -> Result<()>;

    /// Whether connections from this connector are already encrypted
    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Creates a connector for each login attempt
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, common: &ClientCommonConfig) -> Box<dyn Connector>;
}

/// Plain TCP connector
pub struct TcpConnector {
    server_host: String,
    server_port: u16,
    dial_timeout: Duration,
    dns_server: String,
    resolver: Option<TokioAsyncResolver>,
}

impl TcpConnector {
    pub fn new(common: &ClientCommonConfig) -> Self {
        Self {
            server_host: common.server_addr.clone(),
            server_port: common.server_port,
            dial_timeout: common.transport.dial_server_timeout(),
            dns_server: common.dns_server.clone(),
            resolver: None,
        }
    }

    fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    async fn dial(&self) -> Result<TcpStream> {
        let resolver = match &self.resolver {
            Some(resolver) if self.server_host.parse::<IpAddr>().is_err() => resolver,
            _ => return Ok(TcpStream::connect(self.server_addr()).await?),
        };

        let lookup = resolver
            .lookup_ip(self.server_host.as_str())
            .await
            .map_err(|e| {
                ClientError::ConnectionError(format!("resolve {}: {}", self.server_host, e))
            })?;
        let addrs: Vec<SocketAddr> = lookup
            .iter()
            .map(|ip| SocketAddr::new(ip, self.server_port))
            .collect();
        debug!("{} resolved to {:?}", self.server_host, addrs);
        Ok(TcpStream::connect(&addrs[..]).await?)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&mut self) -> Result<()> {
        if let Some(addr) = parse_dns_server(&self.dns_server)? {
            let servers = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
            let config = ResolverConfig::from_parts(None, vec![], servers);
            self.resolver = Some(TokioAsyncResolver::tokio(config, ResolverOpts::default()));
        }
        Ok(())
    }

    async fn connect(&self) -> Result<BoxConn> {
        debug!("dialing {}", self.server_addr());
        let stream = tokio::time::timeout(self.dial_timeout, self.dial())
            .await
            .map_err(|_| ClientError::Timeout(format!("dial {}", self.server_addr())))?
            .map_err(|e| {
                ClientError::ConnectionError(format!("dial {}: {}", self.server_addr(), e))
            })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory used when no custom connector is supplied
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnectorFactory;

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(&self, common: &ClientCommonConfig) -> Box<dyn Connector> {
        if common.transport.protocol != "tcp" {
            tracing::warn!(
                protocol = %common.transport.protocol,
                "unsupported transport protocol, falling back to tcp"
            );
        }
        Box::new(TcpConnector::new(common))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let common = ClientCommonConfig {
            server_addr: "127.0.0.1".to_string(),
            server_port: port,
            ..Default::default()
        };
        let mut connector = DefaultConnectorFactory.create(&common);
        connector.open().await.unwrap();
        let mut conn = connector.connect().await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"hello");
        connector.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let common = ClientCommonConfig {
            server_addr: "127.0.0.1".to_string(),
            server_port: port,
            ..Default::default()
        };
        let connector = TcpConnector::new(&common);
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_dns_server_fails_open() {
        let common = ClientCommonConfig {
            dns_server: "not-an-ip".to_string(),
            ..Default::default()
        };
        let mut connector = TcpConnector::new(&common);
        assert!(matches!(
            connector.open().await,
            Err(ClientError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_dns_server_skips_ip_literals() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        // Nothing answers DNS here; an IP literal must not need it
        let common = ClientCommonConfig {
            server_addr: "127.0.0.1".to_string(),
            server_port: port,
            dns_server: "127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let mut connector = TcpConnector::new(&common);
        connector.open().await.unwrap();
        assert!(connector.resolver.is_some());
        connector.connect().await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_custom_dns_server_failure_is_reported() {
        let mut common = ClientCommonConfig {
            server_addr: "relay.invalid".to_string(),
            server_port: 7000,
            dns_server: "127.0.0.1:1".to_string(),
            ..Default::default()
        };
        common.transport.dial_server_timeout_secs = 2;
        let mut connector = TcpConnector::new(&common);
        connector.open().await.unwrap();
        assert!(connector.connect().await.is_err());
    }
}
