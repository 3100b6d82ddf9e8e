//! sea-orm backed storage with schema-sync on startup.

use async_trait::async_trait;
use sea_orm::{
    ActiveValue, ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Schema,
};

use crate::entities;
use crate::{HealthCheckRow, PromptTemplateRow, SpendLogRow, Storage, StorageError};

impl From<DbErr> for StorageError {
    fn from(err: DbErr) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[derive(Clone)]
pub struct DbStorage {
    db: DatabaseConnection,
}

impl DbStorage {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        let db = Database::connect(database_url).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn sync(&self) -> Result<(), DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::PromptTemplates)
            .register(entities::SpendLogs)
            .register(entities::HealthChecks)
            .sync(&self.db)
            .await
    }
}

fn prompt_row(model: entities::prompt_templates::Model) -> PromptTemplateRow {
    PromptTemplateRow {
        name: model.name,
        version: model.version,
        template: model.template,
        created_at: model.created_at,
    }
}

#[async_trait]
impl Storage for DbStorage {
    async fn prompt_by_name_version(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<PromptTemplateRow>, StorageError> {
        let found = entities::PromptTemplates::find()
            .filter(entities::prompt_templates::Column::Name.eq(name))
            .filter(entities::prompt_templates::Column::Version.eq(version))
            .one(&self.db)
            .await?;
        Ok(found.map(prompt_row))
    }

    async fn latest_prompt(&self, name: &str) -> Result<Option<PromptTemplateRow>, StorageError> {
        let found = entities::PromptTemplates::find()
            .filter(entities::prompt_templates::Column::Name.eq(name))
            .order_by_desc(entities::prompt_templates::Column::Version)
            .one(&self.db)
            .await?;
        Ok(found.map(prompt_row))
    }

    async fn insert_spend_log(&self, row: SpendLogRow) -> Result<(), StorageError> {
        let active = entities::spend_logs::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(row.request_id),
            model_group: ActiveValue::Set(row.model_group),
            provider: ActiveValue::Set(row.provider),
            provider_model: ActiveValue::Set(row.provider_model),
            prompt_tokens: ActiveValue::Set(row.prompt_tokens),
            completion_tokens: ActiveValue::Set(row.completion_tokens),
            total_tokens: ActiveValue::Set(row.total_tokens),
            stream: ActiveValue::Set(row.stream),
            status: ActiveValue::Set(row.status),
            latency_ms: ActiveValue::Set(row.latency_ms),
            created_at: ActiveValue::Set(row.created_at),
        };
        entities::SpendLogs::insert(active).exec(&self.db).await?;
        Ok(())
    }

    async fn insert_health_check(&self, row: HealthCheckRow) -> Result<(), StorageError> {
        let active = entities::health_checks::ActiveModel {
            id: ActiveValue::NotSet,
            service: ActiveValue::Set(row.service),
            healthy: ActiveValue::Set(row.healthy),
            message: ActiveValue::Set(row.message),
            checked_at: ActiveValue::Set(row.checked_at),
        };
        entities::HealthChecks::insert(active).exec(&self.db).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.db
            .ping()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}
