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
pub mod redis;

use crate::clients::proxy::ProxyError;
use crate::model::Job;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use fleet_common::redis::RedisError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const STREAM_EVENT_VERSION: &str = "1.0";

pub fn stream_channel(job_id: &str) -> String {
    format!("stream:v1:{job_id}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventType {
    Start,
    Chunk,
    End,
    Error,
    Cancelled,
}

/// The JSON document published on `stream:v1:<jobId>` for every event of an
/// in-flight job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamEvent {
    pub version: String,
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "rayId", skip_serializing_if = "Option::is_none")]
    pub ray_id: Option<String>,
    pub timestamp: String,
    pub data: JsonValue,
}

impl StreamEvent {
    pub fn new(
        event_type: StreamEventType,
        job_id: &str,
        ray_id: Option<&str>,
        data: JsonValue,
    ) -> Self {
        Self {
            version: STREAM_EVENT_VERSION.to_string(),
            event_type,
            job_id: job_id.to_string(),
            ray_id: ray_id.map(|r| r.to_string()),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("stream event serialization cannot fail")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("redis publish failed: {0}")]
    Redis(#[from] RedisError),
    #[error("proxy publish failed: {0}")]
    Proxy(#[from] ProxyError),
}

/// Per-job event emitter. The runner guarantees ordering (one `start`, then
/// chunks, then exactly one terminal event); implementations are thin
/// publishers.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    async fn start(&self, message: &str) -> Result<(), StreamError>;

    /// Publishes an incremental output chunk; the chunk index is assigned by
    /// the writer and ascends from zero.
    async fn chunk(&self, content: JsonValue) -> Result<(), StreamError>;

    async fn end(&self, result: &HashMap<String, JsonValue>) -> Result<(), StreamError>;

    async fn error(&self, error: &str, recoverable: bool) -> Result<(), StreamError>;

    async fn cancelled(&self, reason: &str) -> Result<(), StreamError>;
}

/// Creates one `StreamWriter` per claimed job.
pub trait StreamWriterFactory: Send + Sync {
    fn create(&self, job: &Job) -> Arc<dyn StreamWriter>;
}

/// Identity shared by the writer implementations: channel, job id, ray id
/// and the ascending chunk counter.
pub(crate) struct JobStreamIdentity {
    pub job_id: String,
    pub ray_id: Option<String>,
    pub channel: String,
    chunk_index: AtomicU64,
}

impl JobStreamIdentity {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            ray_id: job.ray_id.clone(),
            channel: stream_channel(&job.id),
            chunk_index: AtomicU64::new(0),
        }
    }

    pub fn event(&self, event_type: StreamEventType, data: JsonValue) -> StreamEvent {
        StreamEvent::new(event_type, &self.job_id, self.ray_id.as_deref(), data)
    }

    pub fn chunk_event(&self, content: JsonValue) -> StreamEvent {
        let index = self.chunk_index.fetch_add(1, Ordering::SeqCst);
        self.event(
            StreamEventType::Chunk,
            json!({"content": content, "index": index}),
        )
    }
}

/// Satisfies the interface by discarding every event; used when streaming is
/// disabled.
pub struct NoopStreamWriter;

#[async_trait]
impl StreamWriter for NoopStreamWriter {
    async fn start(&self, _message: &str) -> Result<(), StreamError> {
        Ok(())
    }

    async fn chunk(&self, _content: JsonValue) -> Result<(), StreamError> {
        Ok(())
    }

    async fn end(&self, _result: &HashMap<String, JsonValue>) -> Result<(), StreamError> {
        Ok(())
    }

    async fn error(&self, _error: &str, _recoverable: bool) -> Result<(), StreamError> {
        Ok(())
    }

    async fn cancelled(&self, _reason: &str) -> Result<(), StreamError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn event_json_carries_ray_id_when_present() {
        let event = StreamEvent::new(
            StreamEventType::Start,
            "J1",
            Some("R1"),
            json!({"message": "Job started"}),
        );
        let value: JsonValue = serde_json::from_str(&event.to_json()).unwrap();

        assert_eq!(value["version"], "1.0");
        assert_eq!(value["type"], "start");
        assert_eq!(value["jobId"], "J1");
        assert_eq!(value["rayId"], "R1");
        assert_eq!(value["data"]["message"], "Job started");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn event_json_omits_absent_ray_id() {
        let event = StreamEvent::new(StreamEventType::End, "J2", None, json!({"result": {}}));
        let value: JsonValue = serde_json::from_str(&event.to_json()).unwrap();

        assert!(value.get("rayId").is_none());
        assert_eq!(value["type"], "end");
    }

    #[test]
    fn chunk_indices_ascend_from_zero() {
        let identity = JobStreamIdentity {
            job_id: "J3".to_string(),
            ray_id: None,
            channel: stream_channel("J3"),
            chunk_index: AtomicU64::new(0),
        };

        let first = identity.chunk_event(json!("a"));
        let second = identity.chunk_event(json!("b"));
        assert_eq!(first.data["index"], 0);
        assert_eq!(second.data["index"], 1);
        assert_eq!(identity.channel, "stream:v1:J3");
    }
}
