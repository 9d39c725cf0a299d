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

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use fleet_common::redis::{PendingEntry, RedisError, StreamDelivery};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("substrate error: {0}")]
    Redis(#[from] RedisError),
    #[error("{0}")]
    Internal(String),
}

/// The substrate surface the stream source consumes: ordered logs with
/// consumer groups and pending lists, plus the status hash and cancellation
/// flag keys.
///
/// `redis::RedisSubstrateStorage` is the production implementation;
/// `memory::InMemorySubstrateStorage` mirrors its consumer-group semantics
/// in process.
#[async_trait]
pub trait SubstrateStorage: Send + Sync {
    /// Creates the consumer group (and the stream when missing); an already
    /// existing group is not an error.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), StorageError>;

    /// Blocking group read of one fresh message fanning in across the given
    /// streams; `None` when the block time elapsed with no delivery.
    async fn read_group_next(
        &self,
        group: &str,
        consumer: &str,
        block_ms: u64,
        streams: &[String],
    ) -> Result<Option<StreamDelivery>, StorageError>;

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<u64, StorageError>;

    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, StorageError>;

    /// Pending entries of the group in extended form (delivery counts
    /// included).
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StorageError>;

    /// Claims one pending message for `consumer` when it has been idle at
    /// least `min_idle_ms`; returns its fields, or `None` when it was not
    /// claimable.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        message_id: &str,
    ) -> Result<Option<HashMap<String, String>>, StorageError>;

    async fn key_exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}
