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

pub mod proxy;
pub mod stream;

use crate::clients::proxy::ProxyError;
use crate::model::{Job, JobParseError};
use crate::storage::StorageError;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;

pub const JOB_LOG_PREFIX: &str = "jobs:v1:";
pub const DLQ_LOG_PREFIX: &str = "dlq:v1:";

pub fn status_key(job_id: &str) -> String {
    format!("job:{job_id}:status")
}

pub fn cancel_key(job_id: &str) -> String {
    format!("job:cancelled:{job_id}")
}

/// Maps a job log name onto its dead-letter counterpart, preserving the full
/// tag suffix (`jobs:v1:a:b` becomes `dlq:v1:a:b`). Logs outside the
/// `jobs:v1:` family keep their full name as the suffix.
pub fn dlq_log_name(source_log: &str) -> String {
    match source_log.strip_prefix(JOB_LOG_PREFIX) {
        Some(suffix) => format!("{DLQ_LOG_PREFIX}{suffix}"),
        None => format!("{DLQ_LOG_PREFIX}{source_log}"),
    }
}

/// The field set of a dead-letter entry. `enqueuedAt` falls back from the
/// parsed job field to the raw delivery field so the producer's timestamp
/// survives routing verbatim.
pub fn dlq_fields(
    worker_id: &str,
    source_log: &str,
    message_id: &str,
    reason: &str,
    job: Option<&Job>,
    raw_fields: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let job_id = job
        .map(|j| j.id.clone())
        .or_else(|| raw_fields.get("jobId").cloned())
        .unwrap_or_default();
    let enqueued_at = job
        .and_then(|j| j.enqueued_at.clone())
        .or_else(|| raw_fields.get("enqueuedAt").cloned())
        .unwrap_or_default();
    let payload = raw_fields.get("payload").cloned().unwrap_or_default();

    vec![
        ("original_message_id".to_string(), message_id.to_string()),
        ("original_queue".to_string(), source_log.to_string()),
        ("reason".to_string(), reason.to_string()),
        (
            "moved_at".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
        ("worker_id".to_string(), worker_id.to_string()),
        ("jobId".to_string(), job_id),
        ("enqueuedAt".to_string(), enqueued_at),
        ("payload".to_string(), payload),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("substrate error: {0}")]
    Storage(#[from] StorageError),
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error("{0}")]
    Parse(#[from] JobParseError),
}

/// Claim/acknowledge lifecycle over a job substrate.
///
/// `next` blocks up to the implementation's configured timeout and returns
/// `Ok(None)` when no job became available, the normal quiet-queue signal.
/// `nack` records the failure without releasing the delivery claim; the
/// substrate's redelivery mechanism owns the retry.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Identifier used in diagnostics only.
    fn name(&self) -> &str;

    /// Idempotent establishment of the transport and any consumer-group
    /// scaffolding. Failures here are fatal for the worker.
    async fn connect(&self) -> Result<(), SourceError>;

    async fn next(&self) -> Result<Option<Job>, SourceError>;

    /// Confirms terminal handling; the job must not be delivered again.
    async fn ack(&self, job: &Job) -> Result<(), SourceError>;

    async fn nack(&self, job: &Job, error: &str) -> Result<(), SourceError>;

    /// Checks the per-job cancellation flag. Fails open: a lookup error
    /// reports "not cancelled" so the job still executes.
    async fn is_job_cancelled(&self, job_id: &str) -> bool;

    async fn close(&self) -> Result<(), SourceError>;
}

pub(crate) fn status_fields(
    worker_id: &str,
    status: &str,
    error: Option<&str>,
) -> HashMap<String, String> {
    let mut fields = HashMap::from([
        ("status".to_string(), status.to_string()),
        ("worker_id".to_string(), worker_id.to_string()),
        (
            "updated_at".to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    ]);
    if let Some(error) = error {
        fields.insert("error".to_string(), error.to_string());
    }
    fields
}
