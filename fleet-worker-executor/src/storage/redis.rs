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

use crate::storage::{StorageError, SubstrateStorage};
use async_trait::async_trait;
use fleet_common::redis::{PendingEntry, RedisPool, StreamDelivery};
use std::collections::HashMap;

/// Substrate storage backed by the native stream substrate through a
/// `RedisPool`.
pub struct RedisSubstrateStorage {
    redis: RedisPool,
}

impl RedisSubstrateStorage {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl SubstrateStorage for RedisSubstrateStorage {
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        Ok(self.redis.ensure_consumer_group(stream, group).await?)
    }

    async fn read_group_next(
        &self,
        group: &str,
        consumer: &str,
        block_ms: u64,
        streams: &[String],
    ) -> Result<Option<StreamDelivery>, StorageError> {
        Ok(self
            .redis
            .read_group_next(group, consumer, block_ms, streams)
            .await?)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<u64, StorageError> {
        Ok(self.redis.ack(stream, group, message_id).await?)
    }

    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, StorageError> {
        Ok(self.redis.append(stream, fields).await?)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StorageError> {
        Ok(self.redis.pending(stream, group, count).await?)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        message_id: &str,
    ) -> Result<Option<HashMap<String, String>>, StorageError> {
        Ok(self
            .redis
            .claim(stream, group, consumer, min_idle_ms, message_id)
            .await?)
    }

    async fn key_exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.redis.key_exists(key).await?)
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        Ok(self.redis.hash_set(key, fields).await?)
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(self.redis.close().await?)
    }
}
