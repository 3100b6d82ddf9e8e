//! Persistence for the gateway: prompt templates, spend logs, health checks.
//!
//! `MemoryStorage` backs tests and the no-database deployment mode; the
//! `db` feature adds a sea-orm sqlite/postgres implementation with
//! schema-sync on startup.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

#[cfg(feature = "db")]
pub mod db;
#[cfg(feature = "db")]
pub mod entities;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// One version of a named prompt template. Templates are immutable rows;
/// a new version is a new row.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplateRow {
    pub name: String,
    pub version: i64,
    pub template: String,
    pub created_at: OffsetDateTime,
}

/// Per-request accounting row, written after a completed call.
#[derive(Debug, Clone, PartialEq)]
pub struct SpendLogRow {
    pub request_id: String,
    pub model_group: String,
    pub provider: String,
    pub provider_model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub stream: bool,
    pub status: i32,
    pub latency_ms: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckRow {
    pub service: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub checked_at: OffsetDateTime,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn prompt_by_name_version(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<PromptTemplateRow>, StorageError>;

    /// Highest-version row for a prompt name.
    async fn latest_prompt(&self, name: &str) -> Result<Option<PromptTemplateRow>, StorageError>;

    async fn insert_spend_log(&self, row: SpendLogRow) -> Result<(), StorageError>;

    async fn insert_health_check(&self, row: HealthCheckRow) -> Result<(), StorageError>;

    /// Cheap backend reachability probe for readiness.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// In-process storage. Always available; the default when no database
/// url is configured.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    prompts: Mutex<HashMap<String, Vec<PromptTemplateRow>>>,
    spend_logs: Mutex<Vec<SpendLogRow>>,
    health_checks: Mutex<Vec<HealthCheckRow>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_prompt(&self, name: &str, version: i64, template: &str) {
        let row = PromptTemplateRow {
            name: name.to_string(),
            version,
            template: template.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        if let Ok(mut guard) = self.prompts.lock() {
            guard.entry(name.to_string()).or_default().push(row);
        }
    }

    pub fn spend_logs(&self) -> Vec<SpendLogRow> {
        self.spend_logs
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn health_checks(&self) -> Vec<HealthCheckRow> {
        self.health_checks
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn prompt_by_name_version(
        &self,
        name: &str,
        version: i64,
    ) -> Result<Option<PromptTemplateRow>, StorageError> {
        let guard = self
            .prompts
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(guard
            .get(name)
            .and_then(|rows| rows.iter().find(|r| r.version == version))
            .cloned())
    }

    async fn latest_prompt(&self, name: &str) -> Result<Option<PromptTemplateRow>, StorageError> {
        let guard = self
            .prompts
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(guard
            .get(name)
            .and_then(|rows| rows.iter().max_by_key(|r| r.version))
            .cloned())
    }

    async fn insert_spend_log(&self, row: SpendLogRow) -> Result<(), StorageError> {
        self.spend_logs
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .push(row);
        Ok(())
    }

    async fn insert_health_check(&self, row: HealthCheckRow) -> Result<(), StorageError> {
        self.health_checks
            .lock()
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .push(row);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_prompt_prefers_highest_version() {
        let storage = MemoryStorage::new();
        storage.seed_prompt("greeting", 1, "hello {{name}}");
        storage.seed_prompt("greeting", 3, "hi {{name}}");
        storage.seed_prompt("greeting", 2, "hey {{name}}");

        let latest = storage.latest_prompt("greeting").await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(latest.template, "hi {{name}}");

        let pinned = storage
            .prompt_by_name_version("greeting", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.template, "hello {{name}}");

        assert!(storage.latest_prompt("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spend_logs_accumulate() {
        let storage = MemoryStorage::new();
        storage
            .insert_spend_log(SpendLogRow {
                request_id: "req-1".to_string(),
                model_group: "gpt-4o".to_string(),
                provider: "openai".to_string(),
                provider_model: "gpt-4o".to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                stream: false,
                status: 200,
                latency_ms: 120,
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();
        assert_eq!(storage.spend_logs().len(), 1);
        assert_eq!(storage.spend_logs()[0].total_tokens, 15);
    }
}
