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

use crate::config::RedisConfig;
use fred::cmd;
use fred::error::ErrorKind;
use fred::prelude::*;
use fred::types::streams::XReadResponse;
use std::collections::HashMap;
use tracing::debug;

pub use fred::error::Error as RedisError;

/// One message delivered from a stream through a consumer group.
#[derive(Clone, Debug)]
pub struct StreamDelivery {
    pub stream: String,
    pub message_id: String,
    pub fields: HashMap<String, String>,
}

/// One entry of a consumer group's pending list, in the XPENDING extended
/// form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub message_id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Redis client wrapper applying an optional key prefix to every key it
/// touches.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    key_prefix: String,
}

impl RedisPool {
    pub async fn configured(config: &RedisConfig) -> Result<RedisPool, RedisError> {
        let redis_config = Config {
            server: ServerConfig::new_centralized(config.host.clone(), config.port),
            database: Some(config.database),
            username: config.username.clone(),
            password: config.password.clone(),
            ..Config::default()
        };
        let client = Builder::from_config(redis_config).build()?;
        let _ = client.connect();
        client.wait_for_connect().await?;
        debug!(host = config.host, port = config.port, "connected to redis");

        Ok(RedisPool {
            client,
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn prefixed(&self, key: impl AsRef<str>) -> String {
        format!("{}{}", self.key_prefix, key.as_ref())
    }

    /// Creates the consumer group on the given stream, creating the stream
    /// itself when it does not exist yet. Already-existing groups are not an
    /// error.
    pub async fn ensure_consumer_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<(), RedisError> {
        let result: Result<(), RedisError> = self
            .client
            .xgroup_create(self.prefixed(stream), group, "$", true)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(error) if error.to_string().contains("BUSYGROUP") => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Blocking XREADGROUP with `>` across all given streams, count 1.
    /// Returns `None` when the block timeout elapsed with no delivery.
    pub async fn read_group_next(
        &self,
        group: &str,
        consumer: &str,
        block_ms: u64,
        streams: &[String],
    ) -> Result<Option<StreamDelivery>, RedisError> {
        let keys: Vec<String> = streams.iter().map(|s| self.prefixed(s)).collect();
        let ids: Vec<String> = streams.iter().map(|_| ">".to_string()).collect();

        let value: Value = self
            .client
            .xreadgroup(group, consumer, Some(1), Some(block_ms), false, keys, ids)
            .await?;
        if value.is_null() {
            return Ok(None);
        }

        let response: XReadResponse<String, String, String, String> = value.convert()?;
        for (stream, entries) in response {
            if let Some((message_id, fields)) = entries.into_iter().next() {
                let stream = self.strip_prefix(stream);
                return Ok(Some(StreamDelivery {
                    stream,
                    message_id,
                    fields,
                }));
            }
        }
        Ok(None)
    }

    pub async fn ack(
        &self,
        stream: &str,
        group: &str,
        message_id: &str,
    ) -> Result<u64, RedisError> {
        let acked: u64 = self
            .client
            .xack(self.prefixed(stream), group, message_id)
            .await?;
        Ok(acked)
    }

    pub async fn append(
        &self,
        stream: &str,
        fields: Vec<(String, String)>,
    ) -> Result<String, RedisError> {
        let id: String = self
            .client
            .xadd(self.prefixed(stream), false, None, "*", fields)
            .await?;
        Ok(id)
    }

    /// XPENDING in its extended form; the summary form does not expose
    /// per-entry delivery counts.
    pub async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, RedisError> {
        let value: Value = self
            .client
            .custom(
                cmd!("XPENDING"),
                vec![
                    self.prefixed(stream),
                    group.to_string(),
                    "-".to_string(),
                    "+".to_string(),
                    count.to_string(),
                ],
            )
            .await?;
        parse_pending_entries(&value)
    }

    /// XCLAIM of a single message. Returns the claimed field map, or `None`
    /// when the message was not claimable (already claimed elsewhere or
    /// trimmed away).
    pub async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        message_id: &str,
    ) -> Result<Option<HashMap<String, String>>, RedisError> {
        let claimed: Vec<(String, HashMap<String, String>)> = self
            .client
            .xclaim_values(
                self.prefixed(stream),
                group,
                consumer,
                min_idle_ms,
                message_id,
                None,
                None,
                None,
                false,
                false,
            )
            .await?;
        Ok(claimed.into_iter().next().map(|(_, fields)| fields))
    }

    pub async fn key_exists(&self, key: &str) -> Result<bool, RedisError> {
        let count: i64 = self.client.exists(self.prefixed(key)).await?;
        Ok(count > 0)
    }

    pub async fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, String>,
    ) -> Result<(), RedisError> {
        let _: () = self.client.hset(self.prefixed(key), fields).await?;
        Ok(())
    }

    pub async fn publish(&self, channel: &str, message: String) -> Result<(), RedisError> {
        let _: () = self.client.publish(self.prefixed(channel), message).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), RedisError> {
        let _: () = self.client.quit().await?;
        Ok(())
    }

    fn strip_prefix(&self, key: String) -> String {
        if self.key_prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.key_prefix)
                .map(|s| s.to_string())
                .unwrap_or(key)
        }
    }
}

fn parse_pending_entries(value: &Value) -> Result<Vec<PendingEntry>, RedisError> {
    let entries = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        _ => {
            return Err(RedisError::new(
                ErrorKind::Parse,
                "XPENDING: expected array reply",
            ));
        }
    };

    let mut result = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = match entry {
            Value::Array(fields) if fields.len() >= 4 => fields,
            _ => {
                return Err(RedisError::new(
                    ErrorKind::Parse,
                    "XPENDING: malformed pending entry",
                ));
            }
        };
        result.push(PendingEntry {
            message_id: value_to_string(&fields[0]),
            consumer: value_to_string(&fields[1]),
            idle_ms: value_to_u64(&fields[2]),
            delivery_count: value_to_u64(&fields[3]),
        });
    }
    Ok(result)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Bytes(b) => String::from_utf8_lossy(b).to_string(),
        other => format!("{other:?}"),
    }
}

fn value_to_u64(value: &Value) -> u64 {
    match value {
        Value::Integer(i) if *i >= 0 => *i as u64,
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}
