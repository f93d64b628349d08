use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Outbound-proxy records. Opaque to the core — consumed only by the HTTP
/// client wrapper's proxy resolver, never parsed or validated here.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "proxies")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
