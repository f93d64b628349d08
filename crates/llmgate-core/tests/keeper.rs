//! Cross-module Keeper behavior: the fast-fail/verification-loop/penalize
//! state machine driven by real probe HTTP responses (spec.md §4.5/§8).

use std::sync::Arc;

use async_trait::async_trait;
use llmgate_common::{ErrorReason, GatewayPolicy, ProviderConfig, ProviderKind, WorkerConfig, WorkerHealthPolicy};
use llmgate_core::keeper::probe_one_key;
use llmgate_core::metrics::Metrics;
use llmgate_storage::{KeyRow, KeyStatus, Repository, RepositoryResult};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex as TokioMutex;

struct FakeRepo {
    rows: TokioMutex<Vec<KeyRow>>,
}

#[async_trait]
impl Repository for FakeRepo {
    async fn list_eligible(
        &self,
        _provider: &str,
        _resolved_model: &str,
        _now: OffsetDateTime,
    ) -> RepositoryResult<Vec<KeyRow>> {
        Ok(Vec::new())
    }

    async fn list_all(&self, provider: &str, resolved_model: &str) -> RepositoryResult<Vec<KeyRow>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|r| r.provider == provider && r.model == resolved_model)
            .cloned()
            .collect())
    }

    async fn update_key_status(
        &self,
        provider: &str,
        key_hash: &str,
        resolved_model: &str,
        status: KeyStatus,
        reason: Option<ErrorReason>,
        penalty_until: Option<OffsetDateTime>,
    ) -> RepositoryResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows
            .iter_mut()
            .find(|r| r.provider == provider && r.key_hash == key_hash && r.model == resolved_model)
        {
            row.status = status;
            row.reason = reason;
            row.penalty_until = penalty_until;
        }
        Ok(())
    }

    async fn touch_checked(
        &self,
        _provider: &str,
        _key_hash: &str,
        _resolved_model: &str,
        _now: OffsetDateTime,
    ) -> RepositoryResult<()> {
        Ok(())
    }

    async fn ping(&self) -> RepositoryResult<()> {
        Ok(())
    }
}

fn row(provider: &str, key_hash: &str, model: &str) -> KeyRow {
    KeyRow {
        provider: provider.to_string(),
        key_hash: key_hash.to_string(),
        model: model.to_string(),
        status: KeyStatus::Valid,
        reason: None,
        penalty_until: None,
        last_checked_at: None,
    }
}

fn provider_config(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        name: "foo".to_string(),
        kind: ProviderKind::OpenaiLike,
        base_url: base_url.to_string(),
        models: vec!["gpt-4".to_string()],
        shared_key_status: false,
        gateway_policy: GatewayPolicy::default(),
        worker_health_policy: WorkerHealthPolicy::default(),
        proxy_name: None,
    }
}

async fn canned_server(responses: Vec<(u16, &'static str)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status} status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{addr}")
}

fn http_client_config() -> llmgate_common::HttpClientConfig {
    llmgate_common::HttpClientConfig::default()
}

#[tokio::test]
async fn fatal_reason_fast_fails_without_verification() {
    let base_url = canned_server(vec![(401, r#"{"error":"invalid"}"#)]).await;
    let provider = provider_config(&base_url);
    let repo = Arc::new(FakeRepo { rows: TokioMutex::new(vec![row("foo", "k1", "gpt-4")]) });
    let worker = WorkerConfig { verification_attempts: 3, verification_delay_sec: 0, ..Default::default() };
    let metrics = Arc::new(Metrics::new());

    probe_one_key(&repo, &provider, &[], &metrics, &http_client_config(), &worker, "gpt-4", "gpt-4", "k1").await;

    let rows = repo.rows.lock().await;
    let updated = rows.iter().find(|r| r.key_hash == "k1").unwrap();
    assert_eq!(updated.status, KeyStatus::Invalid);
    assert_eq!(updated.reason, Some(ErrorReason::InvalidKey));
}

#[tokio::test]
async fn retryable_reason_recovers_after_verification() {
    let base_url = canned_server(vec![(503, r#"{"error":"overloaded"}"#), (200, r#"{"ok":true}"#)]).await;
    let provider = provider_config(&base_url);
    let repo = Arc::new(FakeRepo { rows: TokioMutex::new(vec![row("foo", "k1", "gpt-4")]) });
    let worker = WorkerConfig { verification_attempts: 3, verification_delay_sec: 0, ..Default::default() };
    let metrics = Arc::new(Metrics::new());

    probe_one_key(&repo, &provider, &[], &metrics, &http_client_config(), &worker, "gpt-4", "gpt-4", "k1").await;

    let rows = repo.rows.lock().await;
    let updated = rows.iter().find(|r| r.key_hash == "k1").unwrap();
    assert_eq!(updated.status, KeyStatus::Valid);
    assert_eq!(updated.reason, None);
}

#[tokio::test]
async fn retryable_reason_penalized_after_verification_exhausted() {
    let base_url = canned_server(vec![
        (503, r#"{"error":"overloaded"}"#),
        (503, r#"{"error":"overloaded"}"#),
        (503, r#"{"error":"overloaded"}"#),
    ])
    .await;
    let provider = provider_config(&base_url);
    let repo = Arc::new(FakeRepo { rows: TokioMutex::new(vec![row("foo", "k1", "gpt-4")]) });
    let worker = WorkerConfig { verification_attempts: 2, verification_delay_sec: 0, ..Default::default() };
    let metrics = Arc::new(Metrics::new());

    probe_one_key(&repo, &provider, &[], &metrics, &http_client_config(), &worker, "gpt-4", "gpt-4", "k1").await;

    let rows = repo.rows.lock().await;
    let updated = rows.iter().find(|r| r.key_hash == "k1").unwrap();
    assert_eq!(updated.status, KeyStatus::Penalized);
    assert_eq!(updated.reason, Some(ErrorReason::Overloaded));
}

#[tokio::test]
async fn successful_probe_transitions_key_to_valid() {
    let base_url = canned_server(vec![(200, r#"{"ok":true}"#)]).await;
    let provider = provider_config(&base_url);
    let repo = Arc::new(FakeRepo { rows: TokioMutex::new(vec![row("foo", "k1", "gpt-4")]) });
    let worker = WorkerConfig::default();
    let metrics = Arc::new(Metrics::new());

    probe_one_key(&repo, &provider, &[], &metrics, &http_client_config(), &worker, "gpt-4", "gpt-4", "k1").await;

    let rows = repo.rows.lock().await;
    assert_eq!(rows.iter().find(|r| r.key_hash == "k1").unwrap().status, KeyStatus::Valid);
}
