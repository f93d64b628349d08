//! The Dispatch Engine ("Conductor", C4): serves one inbound HTTP request
//! end-to-end — key selection, proxying, error classification, and the
//! retry-vs-fail decision (spec.md §4.4).

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use llmgate_cache::CacheError;
use llmgate_classify::classify;
use llmgate_common::{DebugMode, ErrorReason};
use llmgate_provider::{
    Action, Headers, ProviderError, UpstreamBody, build_forward_request, client_for,
    client_requested_stream, header_get, header_set, parse_error_body, send_raw,
    should_passthrough_stream, strip_hop_by_hop,
};
use llmgate_common::ProviderConfig;
use llmgate_storage::{Repository, RepositoryError};
use uuid::Uuid;

use crate::context::AppContext;

/// Resolves `provider.proxy_name` to an outbound-proxy URL via the
/// Repository (spec.md §4.1); `None` dials upstream directly.
async fn resolve_proxy<R: Repository>(
    ctx: &AppContext<R>,
    provider: &ProviderConfig,
) -> Result<Option<String>, RepositoryError> {
    match &provider.proxy_name {
        Some(name) => ctx.repo.proxy_url(name).await,
        None => Ok(None),
    }
}

/// Hard cap on logged request/response bodies in debug mode (spec.md §6).
const DEBUG_BODY_LOG_CAP: usize = 10 * 1024;

/// First 8 hex chars of a key hash, safe to log (spec.md §6: never the full
/// key or a reversible encoding of it).
fn key_hash_prefix(key_hash: &str) -> &str {
    key_hash.get(..8).unwrap_or(key_hash)
}

fn truncated_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= DEBUG_BODY_LOG_CAP {
        text.into_owned()
    } else {
        format!("{}... ({} bytes total)", &text[..DEBUG_BODY_LOG_CAP], text.len())
    }
}

pub struct DispatchRequest {
    pub provider: String,
    pub model: String,
    pub action: Action,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct DispatchResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    UnknownProvider,
    NoHealthyKeys,
}

/// `dispatch(inbound) -> outbound` (spec.md §4.4).
pub async fn dispatch<R: Repository>(
    ctx: &AppContext<R>,
    req: DispatchRequest,
) -> Result<DispatchResponse, DispatchError> {
    let compiled = ctx.provider(&req.provider).ok_or(DispatchError::UnknownProvider)?;
    let provider = &compiled.config;
    let proxy_url = resolve_proxy(ctx, provider).await.map_err(|_| DispatchError::NoHealthyKeys)?;
    let client = client_for(&ctx.http_client, proxy_url.as_deref()).map_err(|_| DispatchError::NoHealthyKeys)?;

    let client_stream = client_requested_stream(provider.kind, req.action, &req.body);
    let passthrough_stream = should_passthrough_stream(
        provider.gateway_policy.streaming_mode,
        provider.gateway_policy.debug_mode,
        client_stream,
    );

    let mut tried_hashes: HashSet<String> = HashSet::new();
    let mut attempts_left = ctx.gateway.retry_policy.max_attempts;
    let mut retries: u32 = 0;
    let trace_id = Uuid::now_v7();

    loop {
        let key_hash = match ctx.cache.acquire_excluding(provider, &req.model, &tried_hashes).await {
            Ok(key) => key,
            Err(CacheError::NoHealthyKeys) => return Err(DispatchError::NoHealthyKeys),
            Err(CacheError::Repository(_)) => return Err(DispatchError::NoHealthyKeys),
        };
        tried_hashes.insert(key_hash.clone());

        tracing::info!(
            %trace_id,
            provider = %provider.name,
            model = %req.model,
            attempt = retries + 1,
            key_hash_prefix = key_hash_prefix(&key_hash),
            "dispatching request"
        );
        if provider.gateway_policy.debug_mode == DebugMode::FullBody {
            tracing::debug!(%trace_id, body = %truncated_body(&req.body), "request body");
        }

        let outbound = build_forward_request(
            provider.kind,
            req.action,
            &provider.base_url,
            &key_hash,
            &req.model,
            &req.headers,
            &req.body,
        );

        let started = std::time::Instant::now();
        let record_latency = |status: &str| {
            ctx.metrics
                .requests_total
                .with_label_values(&[&provider.name, status])
                .inc();
            ctx.metrics
                .latency_seconds
                .with_label_values(&[&provider.name])
                .observe(started.elapsed().as_secs_f64());
        };

        let total_timeout = Duration::from_secs(ctx.http_client.total_timeout_sec);
        let idle_timeout = Duration::from_secs(ctx.http_client.stream_idle_timeout_sec);
        let raw = match send_raw(&client, &outbound, total_timeout).await {
            Ok(raw) => raw,
            Err(err) => {
                let reason = match err {
                    ProviderError::Timeout => ErrorReason::Timeout,
                    _ => ErrorReason::NetworkError,
                };
                record_latency("transport_error");
                tracing::warn!(
                    %trace_id,
                    provider = %provider.name,
                    model = %req.model,
                    attempt = retries + 1,
                    key_hash_prefix = key_hash_prefix(&key_hash),
                    reason = reason.as_str(),
                    "transport error"
                );
                ctx.cache
                    .mark_bad(provider, &req.model, &key_hash, reason)
                    .await
                    .ok();

                if attempts_left > 1 {
                    attempts_left -= 1;
                    retries += 1;
                    continue;
                }
                return Ok(transport_error_response(reason, retries));
            }
        };

        let status = raw.status().as_u16();
        if (200..300).contains(&status) {
            record_latency("success");
            let response = llmgate_provider::materialize(raw, passthrough_stream, total_timeout, idle_timeout)
                .await
                .map_err(|_| DispatchError::NoHealthyKeys)?;
            let mut headers = strip_hop_by_hop(&response.headers);
            header_set(&mut headers, "x-gateway-retries", retries.to_string());
            return Ok(DispatchResponse {
                status: response.status,
                headers,
                body: response.body,
                retries,
            });
        }

        let response = llmgate_provider::materialize(raw, false, total_timeout, idle_timeout)
            .await
            .map_err(|_| DispatchError::NoHealthyKeys)?;
        let UpstreamBody::Buffered(body_bytes) = response.body else {
            unreachable!("materialize(.., false) always buffers");
        };
        let content_type = header_get(&response.headers, "content-type");
        let parsed = parse_error_body(content_type, &body_bytes);
        let reason = classify(status, Some(&parsed), &compiled.rules);
        record_latency(reason.as_str());
        tracing::info!(
            %trace_id,
            provider = %provider.name,
            model = %req.model,
            attempt = retries + 1,
            key_hash_prefix = key_hash_prefix(&key_hash),
            status,
            reason = reason.as_str(),
            "upstream response classified"
        );
        if provider.gateway_policy.debug_mode == DebugMode::FullBody {
            tracing::debug!(%trace_id, body = %truncated_body(&body_bytes), "response body");
        }

        let retry_after = header_get(&response.headers, "retry-after").and_then(parse_retry_after);

        if reason.is_fatal() {
            ctx.cache.mark_bad(provider, &req.model, &key_hash, reason).await.ok();
            if attempts_left > 1 {
                attempts_left -= 1;
                retries += 1;
                continue;
            }
        } else if reason.is_retryable() {
            ctx.cache.mark_bad(provider, &req.model, &key_hash, reason).await.ok();
            if attempts_left > 1 {
                attempts_left -= 1;
                retries += 1;
                if let Some(delay) = retry_after {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
        } else if reason == ErrorReason::Unknown {
            // Canonical resolution of spec.md §9's open question: soft-bad,
            // no retry.
            ctx.cache.mark_bad(provider, &req.model, &key_hash, reason).await.ok();
        }
        // BAD_REQUEST and an exhausted retry budget both fall through here:
        // surface the last upstream response verbatim.
        let mut headers = strip_hop_by_hop(&response.headers);
        header_set(&mut headers, "x-gateway-retries", retries.to_string());
        return Ok(DispatchResponse {
            status: response.status,
            headers,
            body: UpstreamBody::Buffered(body_bytes),
            retries,
        });
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(secs.min(5)))
}

fn transport_error_response(reason: ErrorReason, retries: u32) -> DispatchResponse {
    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "content-type", "application/json");
    header_set(&mut headers, "x-gateway-retries", retries.to_string());
    let body = serde_json::json!({ "error": "upstream_transport_error", "reason": reason.as_str() });
    DispatchResponse {
        status: 502,
        headers,
        body: UpstreamBody::Buffered(Bytes::from(body.to_string())),
        retries,
    }
}
