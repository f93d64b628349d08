//! Process-wide startup context (spec.md §9): the compiled ruleset, the
//! provider table, the Repository handle, and the Key Cache, built once and
//! shared by the Conductor and the Keeper. No global mutable state.

use std::sync::Arc;

use llmgate_cache::KeyCache;
use llmgate_common::{CompiledConfig, CompiledProvider, GatewayConfig, HttpClientConfig, WorkerConfig};
use llmgate_storage::Repository;

use crate::metrics::Metrics;

pub struct AppContext<R: Repository> {
    pub gateway: GatewayConfig,
    pub worker: WorkerConfig,
    pub http_client: HttpClientConfig,
    pub providers: Vec<CompiledProvider>,
    pub repo: Arc<R>,
    pub cache: Arc<KeyCache<R>>,
    pub metrics: Arc<Metrics>,
}

impl<R: Repository> AppContext<R> {
    pub fn new(config: CompiledConfig, repo: Arc<R>) -> Self {
        let cache = Arc::new(KeyCache::new(repo.clone()));
        Self {
            gateway: config.gateway,
            worker: config.worker,
            http_client: config.http_client,
            providers: config.providers.into_values().collect(),
            repo,
            cache,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn provider(&self, name: &str) -> Option<&CompiledProvider> {
        self.providers.iter().find(|p| p.config.name == name)
    }
}
