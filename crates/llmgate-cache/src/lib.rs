//! The Shared Key Cache (C3): per-process, per-`(provider, model)` rotating
//! pools of eligible key hashes, with virtual-all-models collapsing for
//! providers whose key validity is account-wide.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use llmgate_common::{ErrorReason, ProviderConfig};
use llmgate_storage::{KeyStatus, Repository, RepositoryError};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no healthy keys available")]
    NoHealthyKeys,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub type CacheResult<T> = Result<T, CacheError>;

type PoolKey = (String, String);

/// The ordered, rotating sequence of eligible key hashes for one
/// `(provider, resolved_model)` pair.
struct Pool {
    keys: Mutex<VecDeque<String>>,
}

pub struct KeyCache<R: Repository> {
    repo: Arc<R>,
    pools: RwLock<HashMap<PoolKey, Arc<Pool>>>,
}

impl<R: Repository> KeyCache<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self {
            repo,
            pools: RwLock::new(HashMap::new()),
        }
    }

    async fn pool_for(&self, key: PoolKey) -> Arc<Pool> {
        if let Some(pool) = self.pools.read().await.get(&key) {
            return pool.clone();
        }
        let mut pools = self.pools.write().await;
        pools
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Pool {
                    keys: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    /// Resolves the model (collapsing to the virtual-all-models sentinel for
    /// shared-key-status providers), returns the head of the pool's deque and
    /// rotates it to the tail. Lazily reloads from the Repository when the
    /// pool is empty. `excluded` implements the Conductor's per-request
    /// `tried_hashes` set so a single retry loop never returns the same key
    /// twice.
    pub async fn acquire_excluding(
        &self,
        provider: &ProviderConfig,
        model: &str,
        excluded: &HashSet<String>,
    ) -> CacheResult<String> {
        let resolved = provider.resolve_model(model).into_owned();
        let pool = self.pool_for((provider.name.clone(), resolved.clone())).await;
        let mut keys = pool.keys.lock().await;

        if keys.is_empty() {
            self.reload_locked(&mut keys, &provider.name, &resolved).await?;
        }
        if keys.is_empty() {
            return Err(CacheError::NoHealthyKeys);
        }

        let attempts = keys.len();
        for _ in 0..attempts {
            let Some(candidate) = keys.pop_front() else {
                break;
            };
            keys.push_back(candidate.clone());
            if !excluded.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(CacheError::NoHealthyKeys)
    }

    pub async fn acquire(&self, provider: &ProviderConfig, model: &str) -> CacheResult<String> {
        self.acquire_excluding(provider, model, &HashSet::new()).await
    }

    async fn reload_locked(
        &self,
        keys: &mut VecDeque<String>,
        provider: &str,
        resolved_model: &str,
    ) -> CacheResult<()> {
        let rows = self
            .repo
            .list_eligible(provider, resolved_model, OffsetDateTime::now_utc())
            .await?;
        keys.extend(rows.into_iter().map(|row| row.key_hash));
        Ok(())
    }

    /// Removes `key_hash` from the live pool (idempotent) and persists the
    /// penalty derived from `worker_health_policy`.
    pub async fn mark_bad(
        &self,
        provider: &ProviderConfig,
        model: &str,
        key_hash: &str,
        reason: ErrorReason,
    ) -> CacheResult<()> {
        let resolved = provider.resolve_model(model).into_owned();
        let pool = self.pool_for((provider.name.clone(), resolved.clone())).await;
        {
            let mut keys = pool.keys.lock().await;
            keys.retain(|k| k != key_hash);
        }

        let penalty = provider.worker_health_policy.penalty_for(reason);
        let until = OffsetDateTime::now_utc() + penalty;
        let status = if reason.is_fatal() {
            KeyStatus::Invalid
        } else {
            KeyStatus::Penalized
        };
        self.repo
            .update_key_status(&provider.name, key_hash, &resolved, status, Some(reason), Some(until))
            .await?;
        Ok(())
    }

    /// Only the Probe Engine transitions a key back to `VALID`; it does not
    /// need to touch the live pool directly, since the next empty-pool
    /// `acquire` reloads from the Repository and will see the key again.
    pub async fn mark_valid(&self, provider: &ProviderConfig, model: &str, key_hash: &str) -> CacheResult<()> {
        let resolved = provider.resolve_model(model).into_owned();
        self.repo
            .update_key_status(&provider.name, key_hash, &resolved, KeyStatus::Valid, None, None)
            .await?;
        Ok(())
    }

    /// Drops the pool entry, forcing a lazy reload on the next `acquire`.
    pub async fn refresh(&self, provider: &str, resolved_model: &str) {
        self.pools
            .write()
            .await
            .remove(&(provider.to_string(), resolved_model.to_string()));
    }

    pub async fn pool_size(&self, provider: &str, resolved_model: &str) -> usize {
        match self
            .pools
            .read()
            .await
            .get(&(provider.to_string(), resolved_model.to_string()))
        {
            Some(pool) => pool.keys.lock().await.len(),
            None => 0,
        }
    }
}
