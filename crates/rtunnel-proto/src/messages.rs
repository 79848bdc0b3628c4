//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Client login request, first message on a fresh control connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Login {
    pub arch: String,
    pub os: String,
    pub pool_count: u32,
    pub user: String,
    pub version: String,
    /// Unix seconds, also salts the privilege key
    pub timestamp: i64,
    /// Empty on the very first login; reused on every reconnect afterwards
    pub run_id: String,
    pub metas: BTreeMap<String, String>,
    pub privilege_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    /// Non-empty when the server refused the login
    pub error: String,
}

/// Registers one proxy with the server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: String,
    pub remote_port: u16,
    pub custom_domains: Vec<String>,
    pub subdomain: String,
    pub locations: Vec<String>,
    pub host_header_rewrite: String,
    pub metas: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewProxyResp {
    pub proxy_name: String,
    pub remote_addr: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloseProxy {
    pub proxy_name: String,
}

/// Server asks the client to open a new work connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReqWorkConn {}

/// First message on a work connection, sent by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewWorkConn {
    pub run_id: String,
    pub privilege_key: String,
    pub timestamp: i64,
}

/// Server binds a work connection to a proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StartWorkConn {
    pub proxy_name: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    pub privilege_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    pub error: String,
}

/// Every message that can travel over a control or work connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    ReqWorkConn(ReqWorkConn),
    NewWorkConn(NewWorkConn),
    StartWorkConn(StartWorkConn),
    Ping(Ping),
    Pong(Pong),
}

impl Message {
    /// Short type name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Login(_) => "Login",
            Message::LoginResp(_) => "LoginResp",
            Message::NewProxy(_) => "NewProxy",
            Message::NewProxyResp(_) => "NewProxyResp",
            Message::CloseProxy(_) => "CloseProxy",
            Message::ReqWorkConn(_) => "ReqWorkConn",
            Message::NewWorkConn(_) => "NewWorkConn",
            Message::StartWorkConn(_) => "StartWorkConn",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
        }
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_from_message!(
    Login,
    LoginResp,
    NewProxy,
    NewProxyResp,
    CloseProxy,
    ReqWorkConn,
    NewWorkConn,
    StartWorkConn,
    Ping,
    Pong,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_with_metas_serialization() {
        let mut metas = BTreeMap::new();
        metas.insert("team".to_string(), "infra".to_string());
        let msg = Message::Login(Login {
            arch: "x86_64".to_string(),
            os: "linux".to_string(),
            pool_count: 1,
            user: "alice".to_string(),
            version: "0.1.0".to_string(),
            timestamp: 1_700_000_000,
            run_id: "run-1".to_string(),
            metas,
            privilege_key: "abc".to_string(),
        });

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: Message = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);

        if let Message::Login(login) = deserialized {
            assert_eq!(login.metas.get("team").map(String::as_str), Some("infra"));
        } else {
            panic!("Expected Login message");
        }
    }

    #[test]
    fn test_from_conversions() {
        let msg: Message = CloseProxy {
            proxy_name: "web".to_string(),
        }
        .into();
        assert_eq!(msg.kind(), "CloseProxy");

        let msg: Message = ReqWorkConn {}.into();
        assert!(matches!(msg, Message::ReqWorkConn(_)));
    }
}
