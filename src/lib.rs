//! getpool - pooled outbound HTTP GET client with bounded connection reuse

pub mod config;
pub mod core;
pub mod http;
pub mod pool;

pub use self::config::Config;
pub use self::core::Core;
pub use http::{DispatchError, HttpClient, Response};
pub use pool::{ConnectionPool, PoolConfig, PoolError};
