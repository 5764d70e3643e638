//! Public Key Caching
//!
//! Resolves signature key ids to PEM keys, preferring keys already known
//! (memory, then the actors table) over remote fetches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::actor::{ActorFetcher, actor_uri};
use crate::data::Database;
use crate::error::AppError;

/// Entry count above which expired keys are swept on insert
const PRUNE_THRESHOLD: usize = 1024;

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    /// PEM-encoded public key
    pem: String,
    /// When this entry was cached
    cached_at: Instant,
    ttl: Duration,
}

impl CachedKey {
    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Public key cache
///
/// Thread-safe cache for remote actor public keys.
pub struct PublicKeyCache {
    /// Cache storage: key_id -> cached key
    cache: Arc<RwLock<HashMap<String, CachedKey>>>,
    db: Arc<Database>,
    fetcher: Arc<dyn ActorFetcher>,
    default_ttl: Duration,
}

impl PublicKeyCache {
    /// Create new public key cache
    ///
    /// # Arguments
    /// * `db` - Actor store consulted before any remote fetch
    /// * `fetcher` - Source of actor documents for unknown keys
    /// * `default_ttl` - TTL for cached keys (default: 1 hour)
    pub fn new(
        db: Arc<Database>,
        fetcher: Arc<dyn ActorFetcher>,
        default_ttl: Option<Duration>,
    ) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            db,
            fetcher,
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get public key for a key ID
    ///
    /// # Arguments
    /// * `key_id` - Full URL to the key (e.g., actor#main-key)
    ///
    /// # Returns
    /// PEM-encoded public key
    pub async fn get(&self, key_id: &str) -> Result<String, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if cached.is_valid() {
                    tracing::debug!("Public key cache hit for {}", key_id);
                    return Ok(cached.pem.clone());
                }
                tracing::debug!("Public key cache expired for {}", key_id);
            }
        }

        let pem = match self.db.get_actor_public_key(actor_uri(key_id)).await? {
            Some(pem) => pem,
            None => self.fetch_remote(key_id).await?,
        };

        self.store(key_id, &pem).await;
        Ok(pem)
    }

    /// Fetch the key from its origin, bypassing stored copies.
    ///
    /// Used after a verification failure, since the remote actor may have
    /// rotated its key.
    pub async fn refresh(&self, key_id: &str) -> Result<String, AppError> {
        let pem = self.fetch_remote(key_id).await?;
        self.store(key_id, &pem).await;
        Ok(pem)
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!("Invalidated public key cache for {}", key_id);
    }

    async fn fetch_remote(&self, key_id: &str) -> Result<String, AppError> {
        tracing::debug!("Public key cache miss for {}, fetching...", key_id);
        let profile = self.fetcher.fetch_actor(actor_uri(key_id)).await?;

        // If a key fragment is provided, ensure actor advertises exactly that key id.
        if key_id.contains('#') && profile.public_key_id.as_deref() != Some(key_id) {
            return Err(AppError::Validation(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }

        profile
            .public_key_pem
            .ok_or_else(|| AppError::Federation("Missing publicKeyPem in actor".to_string()))
    }

    async fn store(&self, key_id: &str, pem: &str) {
        let mut cache = self.cache.write().await;
        if cache.len() >= PRUNE_THRESHOLD {
            let before = cache.len();
            cache.retain(|_, v| v.is_valid());
            tracing::info!(
                removed = before - cache.len(),
                "Pruned expired public key cache entries"
            );
        }
        cache.insert(
            key_id.to_string(),
            CachedKey {
                pem: pem.to_string(),
                cached_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
    }
}
