//! Connection pooling module
//!
//! This module provides:
//! - Route-partitioned HTTP/1.1 connection pooling with global and per-route caps
//! - Bounded waiting for a free connection slot
//! - Background eviction of idle connections

pub mod connection;
pub mod connector;
pub mod route;

pub use connection::{ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection, RouteStats};
pub use connector::{Connector, Sender};
pub use route::{Route, Scheme};
