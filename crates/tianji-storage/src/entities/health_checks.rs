use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "health_checks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub service: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub checked_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
