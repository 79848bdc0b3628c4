//! Proxy runtime units and the registry that reconciles them

pub mod manager;
pub mod wrapper;

pub use manager::ProxyManager;
pub use wrapper::{
    DefaultWrapperFactory, ProxyWrapper, WorkConnHandler, Wrapper, WrapperContext, WrapperFactory,
};
