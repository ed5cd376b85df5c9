use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use shared_config::AppConfig;
use shared_models::StatusMap;

use crate::error::CacheError;
use crate::services::{FileKeyValueStore, RedisKeyValueStore};

pub const STATUS_CACHE_KEY_PREFIX: &str = "therapist_request_status";

/// String-valued key/value storage, the only thing on-device storage offers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// Last reconciled status map per user, so the UI can render before the
/// first network round-trip. Never fails: misses and broken entries load as
/// an empty map, write failures are logged.
#[derive(Clone)]
pub struct StatusCache {
    backend: Arc<dyn KeyValueStore>,
}

impl StatusCache {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Redis when `REDIS_URL` is configured and reachable, the cache directory
    /// otherwise.
    pub async fn from_config(config: &AppConfig) -> Self {
        if let Some(redis_url) = &config.redis_url {
            match RedisKeyValueStore::connect(redis_url).await {
                Ok(store) => return Self::new(Arc::new(store)),
                Err(e) => warn!("Redis status cache unavailable, falling back to files: {}", e),
            }
        }
        Self::new(Arc::new(FileKeyValueStore::new(&config.status_cache_dir)))
    }

    pub fn key_for(user_id: &str) -> String {
        format!("{}_{}", STATUS_CACHE_KEY_PREFIX, user_id)
    }

    pub async fn load(&self, user_id: &str) -> StatusMap {
        if user_id.is_empty() {
            return StatusMap::default();
        }

        let key = Self::key_for(user_id);
        match self.backend.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<StatusMap>(&raw) {
                Ok(map) => {
                    debug!("Loaded {} cached statuses for {}", map.len(), user_id);
                    map
                }
                Err(e) => {
                    error!("Error parsing stored request data for {}: {}", user_id, e);
                    StatusMap::default()
                }
            },
            Ok(None) => StatusMap::default(),
            Err(e) => {
                error!("Error loading stored request statuses for {}: {}", user_id, e);
                StatusMap::default()
            }
        }
    }

    pub async fn save(&self, user_id: &str, map: &StatusMap) {
        if user_id.is_empty() {
            return;
        }

        let raw = match serde_json::to_string(map) {
            Ok(raw) => raw,
            Err(e) => {
                error!("Error serializing request statuses for {}: {}", user_id, e);
                return;
            }
        };

        if let Err(e) = self.backend.set(&Self::key_for(user_id), &raw).await {
            error!("Error saving request statuses for {}: {}", user_id, e);
        }
    }

    /// Drops the cached map, e.g. on sign-out.
    pub async fn clear(&self, user_id: &str) {
        if let Err(e) = self.backend.remove(&Self::key_for(user_id)).await {
            warn!("Error clearing request statuses for {}: {}", user_id, e);
        }
    }
}
