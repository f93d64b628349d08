use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub provider: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub key_hash: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub model: String,
    pub status: String,
    pub reason: Option<String>,
    pub penalty_until: Option<OffsetDateTime>,
    pub last_checked_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
