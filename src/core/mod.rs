use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::http::{ClientConfig, HttpClient};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};

/// Process-level wiring of the pool and the client
///
/// The HttpClient is created once and shared. Clones share the same
/// connection pool, so connections are reused across every caller.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<Config>,
    client: HttpClient,
}

impl Core {
    /// Build the pool and the client from the configuration
    ///
    /// Must be called inside a Tokio runtime so the idle sweep can start.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(PoolConfig::from(&config.pool))
            .context("Failed to create connection pool")?;
        let client = HttpClient::new(pool, ClientConfig::from(&config.client));

        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    /// Get a clone of the shared client (shares the connection pool)
    pub fn client(&self) -> HttpClient {
        self.client.clone()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.client.pool().stats()
    }
}
