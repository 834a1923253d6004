//! TTL cache for single-shot completions

use super::models::MessageRequest;
use crate::cache::Cacheable;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cache TTL in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum cached responses
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

fn default_ttl_secs() -> u64 {
    600
}

fn default_max_entries() -> u64 {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Get cache TTL as Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Completed response texts keyed by request digest
#[derive(Clone)]
pub struct ResponseCache {
    entries: Cache<String, String>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl())
            .build();
        Self { entries }
    }

    /// Digest of everything that influences the reply
    pub fn key_for(request: &MessageRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.model.as_bytes());
        hasher.update([0u8]);
        if let Some(system) = &request.system {
            hasher.update(system.as_bytes());
        }
        hasher.update([0u8]);
        for message in &request.messages {
            hasher.update(format!("{:?}", message.role).as_bytes());
            hasher.update([0u8]);
            hasher.update(message.content.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(request.max_tokens.to_le_bytes());
        hasher.update(request.temperature.to_le_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, request: &MessageRequest) -> Option<String> {
        self.entries.get(&Self::key_for(request)).await
    }

    pub async fn store(&self, request: &MessageRequest, text: String) {
        self.entries.insert(Self::key_for(request), text).await;
    }
}

impl Cacheable for ResponseCache {
    fn cache_name(&self) -> &str {
        "response_cache"
    }

    fn cached_entries(&self) -> usize {
        self.entries.entry_count() as usize
    }

    fn clear_cache(&self) {
        self.entries.invalidate_all();
    }
}
