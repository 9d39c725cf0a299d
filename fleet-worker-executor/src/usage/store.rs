// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::usage::{UsageRecord, UsageRecorder, UsageStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::config::DbSqliteConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct UsageRecordRow {
    pub id: i64,
    pub job_id: String,
    pub job_type: String,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub node_id: String,
    pub status: String,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub request_bytes: i64,
    pub response_bytes: i64,
    pub synced: bool,
}

impl TryFrom<UsageRecordRow> for UsageRecord {
    type Error = String;

    fn try_from(row: UsageRecordRow) -> Result<Self, Self::Error> {
        Ok(UsageRecord {
            job_id: row.job_id,
            job_type: row.job_type,
            backend: row.backend,
            model: row.model,
            node_id: row.node_id,
            status: UsageStatus::from_str(&row.status)?,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            total_tokens: row.total_tokens,
            request_bytes: row.request_bytes,
            response_bytes: row.response_bytes,
        })
    }
}

/// Durable append-only buffer of terminal job outcomes.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Duplicate `job_id` inserts are silently ignored.
    async fn insert(&self, record: &UsageRecord) -> Result<(), UsageError>;

    /// Oldest-first slice of records not yet drained to the publisher.
    async fn query_unsynced(&self, limit: usize) -> Result<Vec<UsageRecordRow>, UsageError>;

    /// Transactionally flips the sync flag; an empty id list is a no-op.
    async fn mark_synced(&self, ids: &[i64]) -> Result<(), UsageError>;

    async fn close(&self);
}

pub struct SqliteUsageStore {
    pool: Pool<Sqlite>,
}

impl SqliteUsageStore {
    pub async fn configured(config: &DbSqliteConfig) -> Result<SqliteUsageStore, UsageError> {
        info!("usage store: sqlite://{}", config.database);
        let options = SqliteConnectOptions::new()
            .filename(Path::new(config.database.as_str()))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(config.foreign_keys);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./db/migration/sqlite").run(&pool).await?;

        Ok(SqliteUsageStore { pool })
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn insert(&self, record: &UsageRecord) -> Result<(), UsageError> {
        let query = sqlx::query(
            r#"
              INSERT INTO usage_records
                (job_id, job_type, backend, model, node_id, status, error_message,
                 started_at, completed_at, duration_ms,
                 prompt_tokens, completion_tokens, total_tokens, request_bytes, response_bytes,
                 synced)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, FALSE)
              ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(record.job_id.as_str())
        .bind(record.job_type.as_str())
        .bind(record.backend.as_deref())
        .bind(record.model.as_deref())
        .bind(record.node_id.as_str())
        .bind(record.status.as_str())
        .bind(record.error_message.as_deref())
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.total_tokens)
        .bind(record.request_bytes)
        .bind(record.response_bytes);

        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn query_unsynced(&self, limit: usize) -> Result<Vec<UsageRecordRow>, UsageError> {
        let query = sqlx::query_as::<_, UsageRecordRow>(
            "SELECT * FROM usage_records WHERE synced = FALSE ORDER BY id ASC LIMIT $1",
        )
        .bind(limit as i64);

        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn mark_synced(&self, ids: &[i64]) -> Result<(), UsageError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE usage_records SET synced = TRUE WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        builder.push(")");
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Store-backed recorder used by the runner. Accounting failures are logged
/// and never surface to job processing.
pub struct StoreUsageRecorder {
    store: Arc<dyn UsageStore>,
}

impl StoreUsageRecorder {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UsageRecorder for StoreUsageRecorder {
    async fn record(&self, record: UsageRecord) {
        if let Err(error) = self.store.insert(&record).await {
            warn!(
                job_id = record.job_id,
                "failed to persist usage record: {error}"
            );
        }
    }
}
