//! Authentication material attached to outgoing messages

use crate::config::{AuthConfig, AuthMethod, AuthScope};
use crate::error::Result;
use rtunnel_proto::{Login, NewWorkConn, Ping};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Fills in authentication fields before a message is sent
pub trait AuthSetter: Send + Sync {
    fn set_login(&self, login: &mut Login) -> Result<()>;
    fn set_ping(&self, ping: &mut Ping) -> Result<()>;
    fn set_new_work_conn(&self, msg: &mut NewWorkConn) -> Result<()>;
}

/// Hex SHA-256 of the shared token salted with the message timestamp
pub fn privilege_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Shared-token authentication
pub struct TokenAuthSetter {
    token: String,
    additional_scopes: Vec<AuthScope>,
}

impl TokenAuthSetter {
    pub fn new(token: impl Into<String>, additional_scopes: Vec<AuthScope>) -> Self {
        Self {
            token: token.into(),
            additional_scopes,
        }
    }
}

impl AuthSetter for TokenAuthSetter {
    fn set_login(&self, login: &mut Login) -> Result<()> {
        login.privilege_key = privilege_key(&self.token, login.timestamp);
        Ok(())
    }

    fn set_ping(&self, ping: &mut Ping) -> Result<()> {
        if self.additional_scopes.contains(&AuthScope::HeartBeats) {
            ping.timestamp = chrono::Utc::now().timestamp();
            ping.privilege_key = privilege_key(&self.token, ping.timestamp);
        }
        Ok(())
    }

    fn set_new_work_conn(&self, msg: &mut NewWorkConn) -> Result<()> {
        if self.additional_scopes.contains(&AuthScope::NewWorkConns) {
            msg.timestamp = chrono::Utc::now().timestamp();
            msg.privilege_key = privilege_key(&self.token, msg.timestamp);
        }
        Ok(())
    }
}

/// Leaves every message unauthenticated
pub struct NoAuthSetter;

impl AuthSetter for NoAuthSetter {
    fn set_login(&self, _login: &mut Login) -> Result<()> {
        Ok(())
    }

    fn set_ping(&self, _ping: &mut Ping) -> Result<()> {
        Ok(())
    }

    fn set_new_work_conn(&self, _msg: &mut NewWorkConn) -> Result<()> {
        Ok(())
    }
}

/// Build the setter selected by the configuration
pub fn new_auth_setter(cfg: &AuthConfig) -> Arc<dyn AuthSetter> {
    match cfg.method {
        AuthMethod::Token => Arc::new(TokenAuthSetter::new(
            cfg.token.clone(),
            cfg.additional_scopes.clone(),
        )),
        AuthMethod::None => Arc::new(NoAuthSetter),
    }
}
