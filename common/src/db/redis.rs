// Redis connection for the sweep lease

use crate::config::RedisConfig;
use crate::errors::StorageError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Redis connection pool wrapper
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    /// Create a new Redis connection pool
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        info!("Initializing Redis connection pool");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection pool initialized successfully");

        Ok(Self { manager })
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(StorageError::RedisError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}
