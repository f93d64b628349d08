use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Schema,
};
use time::OffsetDateTime;

use llmgate_common::ErrorReason;

use crate::entities::{self, keys, proxies};
use crate::repository::{KeyRow, KeyStatus, Repository, RepositoryError, RepositoryResult};

/// Builds a Postgres DSN from the `DB_HOST`/`DB_PORT`/`DB_USER`/`DB_PASSWORD`/
/// `DB_NAME` environment variables named in spec.md §6.
pub fn dsn_from_env() -> Result<String, String> {
    let host = std::env::var("DB_HOST").map_err(|_| "DB_HOST not set".to_string())?;
    let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("DB_USER").map_err(|_| "DB_USER not set".to_string())?;
    let password = std::env::var("DB_PASSWORD").unwrap_or_default();
    let name = std::env::var("DB_NAME").map_err(|_| "DB_NAME not set".to_string())?;
    Ok(format!("postgres://{user}:{password}@{host}:{port}/{name}"))
}

pub struct SeaOrmRepository {
    db: DatabaseConnection,
}

impl SeaOrmRepository {
    pub async fn connect(dsn: &str) -> RepositoryResult<Self> {
        let db = Database::connect(dsn)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))?;
        Ok(Self { db })
    }

    /// Entity-first schema sync, following the teacher's `Storage::sync` convention.
    pub async fn sync(&self) -> RepositoryResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Keys)
            .register(entities::Proxies)
            .sync(&self.db)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))
    }
}

fn row_from_model(model: keys::Model) -> KeyRow {
    KeyRow {
        provider: model.provider,
        key_hash: model.key_hash,
        model: model.model,
        status: KeyStatus::parse(&model.status),
        reason: model.reason.as_deref().and_then(ErrorReason::parse),
        penalty_until: model.penalty_until,
        last_checked_at: model.last_checked_at,
    }
}

#[async_trait]
impl Repository for SeaOrmRepository {
    async fn list_eligible(
        &self,
        provider: &str,
        resolved_model: &str,
        now: OffsetDateTime,
    ) -> RepositoryResult<Vec<KeyRow>> {
        let rows = keys::Entity::find()
            .filter(keys::Column::Provider.eq(provider))
            .filter(keys::Column::Model.eq(resolved_model))
            .filter(keys::Column::Status.ne(KeyStatus::Invalid.as_str()))
            .all(&self.db)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))?;

        Ok(rows
            .into_iter()
            .filter(|m| m.penalty_until.is_none_or(|until| until <= now))
            .map(row_from_model)
            .collect())
    }

    async fn list_all(&self, provider: &str, resolved_model: &str) -> RepositoryResult<Vec<KeyRow>> {
        let rows = keys::Entity::find()
            .filter(keys::Column::Provider.eq(provider))
            .filter(keys::Column::Model.eq(resolved_model))
            .all(&self.db)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))?;
        Ok(rows.into_iter().map(row_from_model).collect())
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
        let now = OffsetDateTime::now_utc();
        let active = keys::ActiveModel {
            provider: ActiveValue::Set(provider.to_string()),
            key_hash: ActiveValue::Set(key_hash.to_string()),
            model: ActiveValue::Set(resolved_model.to_string()),
            status: ActiveValue::Set(status.as_str().to_string()),
            reason: ActiveValue::Set(reason.map(|r| r.as_str().to_string())),
            penalty_until: ActiveValue::Set(penalty_until),
            last_checked_at: ActiveValue::Set(Some(now)),
        };
        keys::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([keys::Column::Provider, keys::Column::KeyHash, keys::Column::Model])
                    .update_columns([
                        keys::Column::Status,
                        keys::Column::Reason,
                        keys::Column::PenaltyUntil,
                        keys::Column::LastCheckedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))?;
        Ok(())
    }

    async fn touch_checked(
        &self,
        provider: &str,
        key_hash: &str,
        resolved_model: &str,
        now: OffsetDateTime,
    ) -> RepositoryResult<()> {
        let active = keys::ActiveModel {
            provider: ActiveValue::Set(provider.to_string()),
            key_hash: ActiveValue::Set(key_hash.to_string()),
            model: ActiveValue::Set(resolved_model.to_string()),
            status: ActiveValue::NotSet,
            reason: ActiveValue::NotSet,
            penalty_until: ActiveValue::NotSet,
            last_checked_at: ActiveValue::Set(Some(now)),
        };
        keys::Entity::insert(active)
            .on_conflict(
                OnConflict::columns([keys::Column::Provider, keys::Column::KeyHash, keys::Column::Model])
                    .update_column(keys::Column::LastCheckedAt)
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> RepositoryResult<()> {
        use sea_orm::QuerySelect;
        keys::Entity::find()
            .limit(1)
            .all(&self.db)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))?;
        Ok(())
    }

    async fn proxy_url(&self, name: &str) -> RepositoryResult<Option<String>> {
        let row = proxies::Entity::find()
            .filter(proxies::Column::Name.eq(name))
            .filter(proxies::Column::Enabled.eq(true))
            .one(&self.db)
            .await
            .map_err(|err| RepositoryError::Db(err.to_string()))?;
        Ok(row.map(|m| m.url))
    }
}
