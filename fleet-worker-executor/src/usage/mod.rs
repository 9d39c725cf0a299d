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

pub mod store;
pub mod sync;

use crate::model::{
    Job, JobResult, USAGE_COMPLETION_TOKENS_KEY, USAGE_PROMPT_TOKENS_KEY, USAGE_REQUEST_BYTES_KEY,
    USAGE_RESPONSE_BYTES_KEY, USAGE_TOTAL_TOKENS_KEY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

pub const MAX_ERROR_MESSAGE_BYTES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Success,
    Failed,
    Retry,
    Cancelled,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Success => "success",
            UsageStatus::Failed => "failed",
            UsageStatus::Retry => "retry",
            UsageStatus::Cancelled => "cancelled",
        }
    }
}

impl Display for UsageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UsageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(UsageStatus::Success),
            "failed" => Ok(UsageStatus::Failed),
            "retry" => Ok(UsageStatus::Retry),
            "cancelled" => Ok(UsageStatus::Cancelled),
            other => Err(format!("unknown usage status: {other}")),
        }
    }
}

/// One row per terminal job observation, durably buffered locally before
/// being drained to the external accounting publisher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub job_id: String,
    pub job_type: String,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub node_id: String,
    pub status: UsageStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub request_bytes: i64,
    pub response_bytes: i64,
}

impl UsageRecord {
    /// Builds the record for a terminal outcome. `backend` and `model` come
    /// from the job payload when present as strings; the `_usage_*` counters
    /// come from the handler's output.
    pub fn from_outcome(
        node_id: &str,
        job: &Job,
        status: UsageStatus,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: Option<&JobResult>,
        error: Option<&str>,
    ) -> UsageRecord {
        UsageRecord {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            backend: job.payload_str("backend"),
            model: job.payload_str("model"),
            node_id: node_id.to_string(),
            status,
            error_message: error.map(truncate_error),
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0),
            prompt_tokens: counter(result, USAGE_PROMPT_TOKENS_KEY),
            completion_tokens: counter(result, USAGE_COMPLETION_TOKENS_KEY),
            total_tokens: counter(result, USAGE_TOTAL_TOKENS_KEY),
            request_bytes: counter(result, USAGE_REQUEST_BYTES_KEY),
            response_bytes: counter(result, USAGE_RESPONSE_BYTES_KEY),
        }
    }
}

fn counter(result: Option<&JobResult>, key: &str) -> i64 {
    result.map(|r| r.usage_counter(key)).unwrap_or(0)
}

/// Truncates error text to the storage limit on a UTF-8 character boundary.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_MESSAGE_BYTES {
        return error.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_BYTES;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

/// Sink for terminal job outcomes; the runner reports every processed job
/// through this. Implementations must never fail the job over accounting
/// problems.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, record: UsageRecord);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResultStatus;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use test_r::test;

    fn job_with_payload(payload: &[(&str, serde_json::Value)]) -> Job {
        Job {
            id: "J1".to_string(),
            job_type: "INFERENCE".to_string(),
            payload: payload
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            source: "redis".to_string(),
            message_id: "1-0".to_string(),
            source_log: "jobs:v1:t".to_string(),
            ray_id: None,
            enqueued_at: None,
        }
    }

    #[test]
    fn builds_record_from_successful_outcome() {
        let job = job_with_payload(&[
            ("backend", json!("vllm")),
            ("model", json!("llama-3-8b")),
            ("other", json!(1)),
        ]);
        let mut output = HashMap::new();
        output.insert("_usage_prompt_tokens".to_string(), json!(100));
        output.insert("_usage_completion_tokens".to_string(), json!("40"));
        output.insert("_usage_total_tokens".to_string(), json!(140.0));
        let result = JobResult {
            status: ResultStatus::Success,
            output,
            error: None,
            duration: Duration::from_millis(250),
        };

        let started = Utc::now();
        let completed = started + chrono::TimeDelta::milliseconds(250);
        let record = UsageRecord::from_outcome(
            "node-1",
            &job,
            UsageStatus::Success,
            started,
            completed,
            Some(&result),
            None,
        );

        assert_eq!(record.job_id, "J1");
        assert_eq!(record.backend.as_deref(), Some("vllm"));
        assert_eq!(record.model.as_deref(), Some("llama-3-8b"));
        assert_eq!(record.node_id, "node-1");
        assert_eq!(record.duration_ms, 250);
        assert_eq!(record.prompt_tokens, 100);
        assert_eq!(record.completion_tokens, 40);
        assert_eq!(record.total_tokens, 140);
        assert_eq!(record.request_bytes, 0);
        assert_eq!(record.error_message, None);
    }

    #[test]
    fn non_string_backend_is_ignored() {
        let job = job_with_payload(&[("backend", json!(42))]);
        let record = UsageRecord::from_outcome(
            "node-1",
            &job,
            UsageStatus::Failed,
            Utc::now(),
            Utc::now(),
            None,
            Some("boom"),
        );
        assert_eq!(record.backend, None);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn long_errors_are_truncated_to_1024_bytes() {
        let long = "e".repeat(4000);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.len(), MAX_ERROR_MESSAGE_BYTES);

        let multibyte = "é".repeat(1000);
        let truncated = truncate_error(&multibyte);
        assert!(truncated.len() <= MAX_ERROR_MESSAGE_BYTES);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            UsageStatus::Success,
            UsageStatus::Failed,
            UsageStatus::Retry,
            UsageStatus::Cancelled,
        ] {
            assert_eq!(UsageStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(UsageStatus::from_str("completed").is_err());
    }
}
