//! Redis client and utilities
//!
//! This module provides Redis connection management and utilities for:
//! - Named, lazily opened connections per concern (primary, cache, sessions, jobs)
//! - Namespaced caching with TTLs and hit/miss statistics

pub mod cache;
pub mod connections;
pub mod namespaces;

pub use cache::{CacheOptions, CacheService, CacheStats, CacheStore, InMemoryCacheStore, RedisCacheStore};
pub use connections::{ConnectionHealth, RedisConnections, RedisRole};

use crate::error::{Error, Result};
use redis::{aio::ConnectionManager, Client};

/// Create a Redis client from configuration
pub async fn create_client(url: &str) -> Result<ConnectionManager> {
    let client = Client::open(url).map_err(|e| Error::config(format!("Invalid Redis URL: {}", e)))?;

    ConnectionManager::new(client)
        .await
        .map_err(|e| Error::internal(format!("Failed to connect to Redis: {}", e)))
}
