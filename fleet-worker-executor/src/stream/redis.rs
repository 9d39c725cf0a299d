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

use crate::model::Job;
use crate::stream::{
    JobStreamIdentity, StreamError, StreamEvent, StreamEventType, StreamWriter,
    StreamWriterFactory,
};
use async_trait::async_trait;
use fleet_common::redis::RedisPool;
use serde_json::Value as JsonValue;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Publishes stream events on the job's pubsub channel directly on the
/// substrate.
pub struct RedisStreamWriter {
    redis: RedisPool,
    identity: JobStreamIdentity,
}

impl RedisStreamWriter {
    pub fn new(redis: RedisPool, job: &Job) -> Self {
        Self {
            redis,
            identity: JobStreamIdentity::for_job(job),
        }
    }

    async fn publish(&self, event: StreamEvent) -> Result<(), StreamError> {
        self.redis
            .publish(&self.identity.channel, event.to_json())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StreamWriter for RedisStreamWriter {
    async fn start(&self, message: &str) -> Result<(), StreamError> {
        self.publish(
            self.identity
                .event(StreamEventType::Start, json!({"message": message})),
        )
        .await
    }

    async fn chunk(&self, content: JsonValue) -> Result<(), StreamError> {
        self.publish(self.identity.chunk_event(content)).await
    }

    async fn end(&self, result: &HashMap<String, JsonValue>) -> Result<(), StreamError> {
        self.publish(
            self.identity
                .event(StreamEventType::End, json!({"result": result})),
        )
        .await
    }

    async fn error(&self, error: &str, recoverable: bool) -> Result<(), StreamError> {
        self.publish(self.identity.event(
            StreamEventType::Error,
            json!({"error": error, "recoverable": recoverable}),
        ))
        .await
    }

    async fn cancelled(&self, reason: &str) -> Result<(), StreamError> {
        self.publish(
            self.identity
                .event(StreamEventType::Cancelled, json!({"reason": reason})),
        )
        .await
    }
}

pub struct RedisStreamWriterFactory {
    redis: RedisPool,
}

impl RedisStreamWriterFactory {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }
}

impl StreamWriterFactory for RedisStreamWriterFactory {
    fn create(&self, job: &Job) -> Arc<dyn StreamWriter> {
        Arc::new(RedisStreamWriter::new(self.redis.clone(), job))
    }
}
