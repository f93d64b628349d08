//! The Probe Engine ("Keeper", C5): scheduled health checks, the
//! verification loop for transient failures, and the key health state
//! machine (spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use llmgate_common::{CompiledProvider, ErrorReason, ProviderConfig};
use llmgate_provider::{client_for, probe};
use llmgate_storage::{KeyStatus, Repository, RepositoryError};
use time::OffsetDateTime;
use tokio::sync::Semaphore;

use crate::context::AppContext;

/// Resolves `provider.proxy_name` to an outbound-proxy URL via the
/// Repository (spec.md §4.1); `None` dials upstream directly.
async fn resolve_proxy<R: Repository>(
    repo: &Arc<R>,
    provider: &ProviderConfig,
) -> Result<Option<String>, RepositoryError> {
    match &provider.proxy_name {
        Some(name) => repo.proxy_url(name).await,
        None => Ok(None),
    }
}

/// First 8 hex chars of a key hash, safe to log (spec.md §6: never the full
/// key or a reversible encoding of it).
fn key_hash_prefix(key_hash: &str) -> &str {
    key_hash.get(..8).unwrap_or(key_hash)
}

/// Spawns one scheduler task per configured provider. Each task loops
/// forever at `worker.interval_sec`, probing every known key for the
/// provider's representative model set with a bounded in-flight concurrency.
pub fn spawn_schedulers<R: Repository + 'static>(ctx: Arc<AppContext<R>>) -> Vec<tokio::task::JoinHandle<()>> {
    ctx.providers
        .iter()
        .map(|compiled| {
            let ctx = ctx.clone();
            let provider_name = compiled.config.name.clone();
            tokio::spawn(async move { run_provider_scheduler(ctx, provider_name).await })
        })
        .collect()
}

async fn run_provider_scheduler<R: Repository + 'static>(ctx: Arc<AppContext<R>>, provider_name: String) {
    loop {
        if let Some(compiled) = ctx.provider(&provider_name) {
            run_probe_cycle(&ctx, compiled).await;
            tokio::time::sleep(Duration::from_secs(ctx.worker.interval_sec)).await;
        } else {
            return;
        }
    }
}

/// One sweep over every key known for this provider's representative models.
/// Shared-key-status providers only ever carry rows under the
/// `__ALL_MODELS__` sentinel, so a single representative model drives the
/// probe HTTP call while the update targets that sentinel row.
async fn run_probe_cycle<R: Repository + 'static>(ctx: &AppContext<R>, compiled: &CompiledProvider) {
    let provider = &compiled.config;
    let Some(representative_model) = provider.models.first() else {
        return;
    };
    let resolved_model = provider.resolve_model(representative_model).into_owned();

    let rows = match ctx.repo.list_all(&provider.name, &resolved_model).await {
        Ok(rows) => rows,
        Err(_) => return,
    };

    let semaphore = Arc::new(Semaphore::new(ctx.worker.concurrency));
    let mut handles = Vec::with_capacity(rows.len());
    for row in rows {
        let semaphore = semaphore.clone();
        let provider = provider.clone();
        let rules = compiled.rules.clone();
        let repo = ctx.repo.clone();
        let metrics = ctx.metrics.clone();
        let http_client = ctx.http_client.clone();
        let worker = ctx.worker.clone();
        let representative_model = representative_model.clone();
        let resolved_model = resolved_model.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            probe_one_key(
                &repo,
                &provider,
                &rules,
                &metrics,
                &http_client,
                &worker,
                &representative_model,
                &resolved_model,
                &row.key_hash,
            )
            .await;
        }));
    }
    for handle in handles {
        handle.await.ok();
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn probe_one_key<R: Repository>(
    repo: &Arc<R>,
    provider: &ProviderConfig,
    rules: &[llmgate_common::ErrorParsingRule],
    metrics: &Arc<crate::metrics::Metrics>,
    http_client: &llmgate_common::HttpClientConfig,
    worker: &llmgate_common::WorkerConfig,
    representative_model: &str,
    resolved_model: &str,
    key_hash: &str,
) {
    let Ok(proxy_url) = resolve_proxy(repo, provider).await else {
        return;
    };
    let Ok(client) = client_for(http_client, proxy_url.as_deref()) else {
        return;
    };

    let result = probe(&client, provider.kind, &provider.base_url, key_hash, representative_model, rules, http_client).await;
    metrics
        .probe_total
        .with_label_values(&[&provider.name, result.reason.map(ErrorReason::as_str).unwrap_or("OK")])
        .inc();

    repo.touch_checked(&provider.name, key_hash, resolved_model, OffsetDateTime::now_utc())
        .await
        .ok();

    if result.ok {
        tracing::debug!(
            provider = %provider.name,
            model = resolved_model,
            key_hash_prefix = key_hash_prefix(key_hash),
            "probe ok"
        );
        transition_valid(repo, provider, resolved_model, key_hash).await;
        return;
    }

    let reason = result.reason.unwrap_or(ErrorReason::Unknown);
    tracing::warn!(
        provider = %provider.name,
        model = resolved_model,
        key_hash_prefix = key_hash_prefix(key_hash),
        reason = reason.as_str(),
        "probe failed"
    );
    if reason.is_fatal() {
        let penalty = provider.worker_health_policy.penalty_for(reason);
        penalize(repo, provider, resolved_model, key_hash, reason, penalty).await;
        return;
    }

    if reason.is_retryable() {
        run_verification_loop(repo, provider, rules, http_client, worker, representative_model, resolved_model, key_hash, reason)
            .await;
        return;
    }

    // BAD_REQUEST / UNKNOWN: no verification loop, soft penalty.
    let penalty = provider.worker_health_policy.penalty_for(reason);
    penalize(repo, provider, resolved_model, key_hash, reason, penalty).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_verification_loop<R: Repository>(
    repo: &Arc<R>,
    provider: &ProviderConfig,
    rules: &[llmgate_common::ErrorParsingRule],
    http_client: &llmgate_common::HttpClientConfig,
    worker: &llmgate_common::WorkerConfig,
    representative_model: &str,
    resolved_model: &str,
    key_hash: &str,
    first_reason: ErrorReason,
) {
    let Ok(proxy_url) = resolve_proxy(repo, provider).await else {
        return;
    };
    let Ok(client) = client_for(http_client, proxy_url.as_deref()) else {
        return;
    };
    let mut last_reason = first_reason;
    for attempt in 1..=worker.verification_attempts {
        tokio::time::sleep(Duration::from_secs(worker.verification_delay_sec)).await;
        let result = probe(&client, provider.kind, &provider.base_url, key_hash, representative_model, rules, http_client).await;
        if result.ok {
            tracing::info!(
                provider = %provider.name,
                model = resolved_model,
                key_hash_prefix = key_hash_prefix(key_hash),
                attempt,
                "verification recovered key"
            );
            transition_valid(repo, provider, resolved_model, key_hash).await;
            return;
        }
        last_reason = result.reason.unwrap_or(ErrorReason::Unknown);
        tracing::warn!(
            provider = %provider.name,
            model = resolved_model,
            key_hash_prefix = key_hash_prefix(key_hash),
            attempt,
            reason = last_reason.as_str(),
            "verification attempt failed"
        );
    }
    let penalty = provider.worker_health_policy.penalty_for(last_reason);
    penalize(repo, provider, resolved_model, key_hash, last_reason, penalty).await;
}

async fn transition_valid<R: Repository>(repo: &Arc<R>, provider: &ProviderConfig, resolved_model: &str, key_hash: &str) {
    repo.update_key_status(&provider.name, key_hash, resolved_model, KeyStatus::Valid, None, None)
        .await
        .ok();
}

async fn penalize<R: Repository>(
    repo: &Arc<R>,
    provider: &ProviderConfig,
    resolved_model: &str,
    key_hash: &str,
    reason: ErrorReason,
    penalty: Duration,
) {
    let status = if reason.is_fatal() { KeyStatus::Invalid } else { KeyStatus::Penalized };
    let until = OffsetDateTime::now_utc() + penalty;
    repo.update_key_status(&provider.name, key_hash, resolved_model, status, Some(reason), Some(until))
        .await
        .ok();
}
