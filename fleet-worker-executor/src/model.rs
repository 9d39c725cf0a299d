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

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;

/// Producer-set payload key requesting a specific physical GPU.
pub const TARGET_GPU_KEY: &str = "targetGpu";
/// Payload key injected by the runner once a GPU slot has been acquired.
pub const ASSIGNED_GPU_KEY: &str = "_gpuIndex";

pub const USAGE_PROMPT_TOKENS_KEY: &str = "_usage_prompt_tokens";
pub const USAGE_COMPLETION_TOKENS_KEY: &str = "_usage_completion_tokens";
pub const USAGE_TOTAL_TOKENS_KEY: &str = "_usage_total_tokens";
pub const USAGE_REQUEST_BYTES_KEY: &str = "_usage_request_bytes";
pub const USAGE_RESPONSE_BYTES_KEY: &str = "_usage_response_bytes";

pub type JobPayload = HashMap<String, JsonValue>;

/// A single claimed unit of work.
///
/// `id` identifies the job across the whole substrate; `message_id` is the
/// delivery identifier assigned by the substrate and is only meaningful
/// together with `source_log` when acknowledging.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: JobPayload,
    pub source: String,
    pub message_id: String,
    pub source_log: String,
    pub ray_id: Option<String>,
    pub enqueued_at: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobParseError {
    #[error("delivery {message_id} on {source_log} has no jobId field")]
    MissingJobId {
        source_log: String,
        message_id: String,
    },
    #[error("job {job_id} carries an invalid payload: {error}")]
    InvalidPayload { job_id: String, error: String },
}

impl Job {
    /// Builds a job from the field map of a substrate delivery. The payload
    /// field holds a JSON object serialized as a string; a missing payload is
    /// treated as empty.
    pub fn from_fields(
        source: &str,
        source_log: &str,
        message_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<Job, JobParseError> {
        let id = fields
            .get("jobId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| JobParseError::MissingJobId {
                source_log: source_log.to_string(),
                message_id: message_id.to_string(),
            })?
            .clone();

        let payload = match fields.get("payload") {
            Some(raw) if !raw.is_empty() => serde_json::from_str::<JobPayload>(raw)
                .map_err(|e| JobParseError::InvalidPayload {
                    job_id: id.clone(),
                    error: e.to_string(),
                })?,
            _ => JobPayload::new(),
        };

        Ok(Job {
            id,
            job_type: fields.get("type").cloned().unwrap_or_default(),
            payload,
            source: source.to_string(),
            message_id: message_id.to_string(),
            source_log: source_log.to_string(),
            ray_id: fields.get("rayId").filter(|r| !r.is_empty()).cloned(),
            enqueued_at: fields
                .get("enqueuedAt")
                .filter(|e| !e.is_empty())
                .cloned(),
        })
    }

    /// The producer-requested GPU index, when the payload carries a
    /// number-like `targetGpu`.
    pub fn target_gpu(&self) -> Option<i64> {
        self.payload.get(TARGET_GPU_KEY).and_then(coerce_i64)
    }

    pub fn payload_str(&self, key: &str) -> Option<String> {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    Failure,
    Retry,
}

/// Terminal outcome produced by a handler.
#[derive(Clone, Debug)]
pub struct JobResult {
    pub status: ResultStatus,
    pub output: HashMap<String, JsonValue>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl JobResult {
    pub fn success(output: HashMap<String, JsonValue>, duration: Duration) -> Self {
        Self {
            status: ResultStatus::Success,
            output,
            error: None,
            duration,
        }
    }

    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: ResultStatus::Failure,
            output: HashMap::new(),
            error: Some(error.into()),
            duration,
        }
    }

    pub fn retry(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: ResultStatus::Retry,
            output: HashMap::new(),
            error: Some(error.into()),
            duration,
        }
    }

    /// Reads a `_usage_*` counter from the output, coercing number-like
    /// representations; anything else counts as zero.
    pub fn usage_counter(&self, key: &str) -> i64 {
        self.output.get(key).and_then(coerce_i64).unwrap_or(0)
    }
}

/// Narrow numeric coercion shared by `targetGpu` and the `_usage_*` keys:
/// integers, floats (truncated) and numeric strings; everything else is
/// rejected.
pub fn coerce_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s
            .parse::<i64>()
            .ok()
            .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64)),
        _ => None,
    }
}
