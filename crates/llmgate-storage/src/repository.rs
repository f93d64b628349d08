use async_trait::async_trait;
use llmgate_common::ErrorReason;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Valid,
    Invalid,
    Penalized,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Valid => "VALID",
            KeyStatus::Invalid => "INVALID",
            KeyStatus::Penalized => "PENALIZED",
        }
    }

    pub fn parse(s: &str) -> KeyStatus {
        match s {
            "INVALID" => KeyStatus::Invalid,
            "PENALIZED" => KeyStatus::Penalized,
            _ => KeyStatus::Valid,
        }
    }
}

/// A row of the `keys` table (spec.md §3 / §6), as seen by the Cache and the
/// Probe Engine.
#[derive(Debug, Clone)]
pub struct KeyRow {
    pub provider: String,
    pub key_hash: String,
    pub model: String,
    pub status: KeyStatus,
    pub reason: Option<ErrorReason>,
    pub penalty_until: Option<OffsetDateTime>,
    pub last_checked_at: Option<OffsetDateTime>,
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Db(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// The Repository contract (C6). The relational persistence layer is an
/// opaque collaborator behind this trait — the Cache (C3) and the Probe
/// Engine (C5) depend only on these four operations.
#[async_trait]
pub trait Repository: Send + Sync {
    /// `status != INVALID AND (penalty_until IS NULL OR penalty_until <= now)`.
    async fn list_eligible(
        &self,
        provider: &str,
        resolved_model: &str,
        now: OffsetDateTime,
    ) -> RepositoryResult<Vec<KeyRow>>;

    /// Every row for `(provider, resolved_model)`, used by the probe scheduler.
    async fn list_all(&self, provider: &str, resolved_model: &str) -> RepositoryResult<Vec<KeyRow>>;

    /// Upsert on `(provider, key_hash, resolved_model)`.
    async fn update_key_status(
        &self,
        provider: &str,
        key_hash: &str,
        resolved_model: &str,
        status: KeyStatus,
        reason: Option<ErrorReason>,
        penalty_until: Option<OffsetDateTime>,
    ) -> RepositoryResult<()>;

    async fn touch_checked(
        &self,
        provider: &str,
        key_hash: &str,
        resolved_model: &str,
        now: OffsetDateTime,
    ) -> RepositoryResult<()>;

    /// Used by `GET /healthz`: a trivial round-trip to prove the database is reachable.
    async fn ping(&self) -> RepositoryResult<()>;

    /// Resolves an outbound-proxy URL by `proxies.name`, `None` if no
    /// enabled row matches (spec.md §4.1's "optionally bind to an outbound
    /// proxy"). Defaulted to `Ok(None)` so Repository test doubles that
    /// don't exercise proxying don't need to implement it.
    async fn proxy_url(&self, _name: &str) -> RepositoryResult<Option<String>> {
        Ok(None)
    }
}
