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
use fleet_common::redis::{PendingEntry, StreamDelivery};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

struct PendingMessage {
    message_id: String,
    consumer: String,
    idle_ms: u64,
    delivery_count: u64,
    fields: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, VecDeque<(String, HashMap<String, String>)>>,
    pending: HashMap<(String, String), Vec<PendingMessage>>,
    groups: HashSet<(String, String)>,
    hashes: HashMap<String, HashMap<String, String>>,
    keys: HashSet<String>,
    next_id: u64,
}

/// In-process substrate storage with the same consumer-group semantics as
/// the native substrate: a fresh read moves the message to the group's
/// pending list with delivery count 1, a claim requires the configured idle
/// time and increments the count, an ack removes the pending entry.
///
/// Idle time does not pass by itself; tests drive it with `advance_time`.
#[derive(Default)]
pub struct InMemorySubstrateStorage {
    state: Mutex<State>,
}

impl InMemorySubstrateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer-side append, so tests read naturally.
    pub fn enqueue(&self, stream: &str, fields: Vec<(String, String)>) -> String {
        self.append_entry(stream, fields)
    }

    pub fn set_key(&self, key: &str) {
        self.state.lock().unwrap().keys.insert(key.to_string());
    }

    /// Ages every pending entry by the given number of milliseconds.
    pub fn advance_time(&self, ms: u64) {
        let mut state = self.state.lock().unwrap();
        for entries in state.pending.values_mut() {
            for entry in entries.iter_mut() {
                entry.idle_ms += ms;
            }
        }
    }

    /// Entries not yet delivered to any consumer (dead-letter logs included,
    /// since nothing consumes them).
    pub fn stream_entries(&self, stream: &str) -> Vec<(String, HashMap<String, String>)> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pending
            .get(&(stream.to_string(), group.to_string()))
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn hash(&self, key: &str) -> Option<HashMap<String, String>> {
        self.state.lock().unwrap().hashes.get(key).cloned()
    }

    fn append_entry(&self, stream: &str, fields: Vec<(String, String)>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let message_id = format!("{}-0", state.next_id);
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .push_back((message_id.clone(), fields.into_iter().collect()));
        message_id
    }
}

#[async_trait]
impl SubstrateStorage for InMemorySubstrateStorage {
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        self.state
            .lock()
            .unwrap()
            .groups
            .insert((stream.to_string(), group.to_string()));
        Ok(())
    }

    async fn read_group_next(
        &self,
        group: &str,
        consumer: &str,
        _block_ms: u64,
        streams: &[String],
    ) -> Result<Option<StreamDelivery>, StorageError> {
        let mut state = self.state.lock().unwrap();
        for stream in streams {
            let entry = state
                .streams
                .get_mut(stream)
                .and_then(|entries| entries.pop_front());
            let Some((message_id, fields)) = entry else {
                continue;
            };
            state
                .pending
                .entry((stream.clone(), group.to_string()))
                .or_default()
                .push(PendingMessage {
                    message_id: message_id.clone(),
                    consumer: consumer.to_string(),
                    idle_ms: 0,
                    delivery_count: 1,
                    fields: fields.clone(),
                });
            return Ok(Some(StreamDelivery {
                stream: stream.clone(),
                message_id,
                fields,
            }));
        }
        Ok(None)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<u64, StorageError> {
        let mut state = self.state.lock().unwrap();
        let Some(entries) = state
            .pending
            .get_mut(&(stream.to_string(), group.to_string()))
        else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|entry| entry.message_id != message_id);
        Ok((before - entries.len()) as u64)
    }

    async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, StorageError> {
        Ok(self.append_entry(stream, fields))
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StorageError> {
        let state = self.state.lock().unwrap();
        let entries = state
            .pending
            .get(&(stream.to_string(), group.to_string()))
            .map(|entries| {
                entries
                    .iter()
                    .take(count)
                    .map(|entry| PendingEntry {
                        message_id: entry.message_id.clone(),
                        consumer: entry.consumer.clone(),
                        idle_ms: entry.idle_ms,
                        delivery_count: entry.delivery_count,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        message_id: &str,
    ) -> Result<Option<HashMap<String, String>>, StorageError> {
        let mut state = self.state.lock().unwrap();
        let Some(entries) = state
            .pending
            .get_mut(&(stream.to_string(), group.to_string()))
        else {
            return Ok(None);
        };
        for entry in entries.iter_mut() {
            if entry.message_id == message_id && entry.idle_ms >= min_idle_ms {
                entry.consumer = consumer.to_string();
                entry.idle_ms = 0;
                entry.delivery_count += 1;
                return Ok(Some(entry.fields.clone()));
            }
        }
        Ok(None)
    }

    async fn key_exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().unwrap().keys.contains(key))
    }

    async fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.state
            .lock()
            .unwrap()
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
