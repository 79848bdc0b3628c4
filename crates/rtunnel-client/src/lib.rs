//! Reverse-tunnel client core
//!
//! A [`Service`] logs in to the relay server, keeps one [`Control`] session
//! alive across disconnects and reconciles the desired proxy configuration
//! against the session's [`ProxyManager`].

pub mod admin;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod connector;
pub mod control;
pub mod error;
pub mod event;
pub mod proxy;
pub mod service;
pub mod status;
pub mod transport;
pub mod webhook;

pub use config::{ClientCommonConfig, ClientConfig, ProxyConfig, ProxyKind, VisitorConfig};
pub use control::{Control, SessionContext};
pub use error::{ClientError, Result};
pub use proxy::ProxyManager;
pub use service::{RunState, Service, ServiceOptions};
pub use status::{StatusExporter, WorkingDetail, WorkingStatus};
