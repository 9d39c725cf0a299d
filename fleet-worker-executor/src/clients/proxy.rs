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

use crate::config::ProxyJobSourceConfig;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Extra client-side budget on top of the server-side consume block time.
const CONSUME_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("proxy returned HTTP {status}: {error}")]
    Api {
        status: u16,
        error: String,
        error_description: Option<String>,
    },
    #[error("invalid proxy response: {0}")]
    InvalidResponse(String),
    #[error("invalid proxy url: {0}")]
    InvalidUrl(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl ProxyError {
    pub fn is_retriable(&self) -> bool {
        match self {
            ProxyError::Http(_) => true,
            ProxyError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct ConsumeRequest<'a> {
    queue: &'a str,
    consumer_group: &'a str,
    consumer: &'a str,
    count: u32,
    block_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ConsumeResponse {
    #[serde(default)]
    pub messages: Vec<ConsumedMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ConsumedMessage {
    pub id: String,
    #[serde(default)]
    pub data: HashMap<String, JsonValue>,
}

impl ConsumedMessage {
    /// Flattens the delivery data into the substrate's field-value form.
    /// String values stay as-is, everything else keeps its JSON rendering;
    /// nulls are dropped.
    pub fn fields(&self) -> HashMap<String, String> {
        self.data
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let rendered = match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct AcknowledgeRequest<'a> {
    queue: &'a str,
    consumer_group: &'a str,
    message_id: &'a str,
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    channel: &'a str,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct KvSetRequest<'a> {
    key: &'a str,
    value: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct KvGetResponse {
    #[serde(default)]
    value: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Operations of the substrate proxy: consume, acknowledge, publish, KV and
/// liveness.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    async fn ping(&self) -> Result<(), ProxyError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_group: &str,
        consumer: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<ConsumedMessage>, ProxyError>;

    async fn acknowledge(
        &self,
        queue: &str,
        consumer_group: &str,
        message_id: &str,
    ) -> Result<(), ProxyError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), ProxyError>;

    async fn kv_get(&self, key: &str) -> Result<Option<JsonValue>, ProxyError>;

    async fn kv_set(
        &self,
        key: &str,
        value: JsonValue,
        ttl: Option<Duration>,
    ) -> Result<(), ProxyError>;

    async fn kv_delete(&self, key: &str) -> Result<(), ProxyError>;
}

/// HTTP implementation of the proxy operations. Every request carries the
/// configured bearer token.
pub struct ProxyClientLive {
    client: reqwest::Client,
    consume_client: reqwest::Client,
    base_url: Url,
}

impl ProxyClientLive {
    pub fn new(config: &ProxyJobSourceConfig, block_timeout: Duration) -> Result<Self, ProxyError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.access_token))
            .map_err(|e| ProxyError::InvalidUrl(format!("invalid access token: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .default_headers(headers.clone())
            .connect_timeout(config.http_client.connect_timeout)
            .timeout(config.http_client.request_timeout)
            .build()?;
        let consume_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.http_client.connect_timeout)
            .timeout(block_timeout + CONSUME_TIMEOUT_SLACK)
            .build()?;

        Ok(Self {
            client,
            consume_client,
            base_url: config.base_url.clone(),
        })
    }

    /// The `/ws` endpoint with the scheme switched to `ws`/`wss`.
    pub fn websocket_url(&self) -> Result<Url, ProxyError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ProxyError::InvalidUrl("cannot derive websocket scheme".to_string()))?;
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProxyError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ProxyError::InvalidUrl("proxy base url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(path);
        Ok(url)
    }

    async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ProxyError> {
        let response = Self::expect_success(response).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ProxyError::InvalidResponse(e.to_string()))
    }

    async fn expect_success(response: Response) -> Result<Response, ProxyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let status = status.as_u16();
        let body = response.bytes().await.unwrap_or_default();
        match serde_json::from_slice::<ErrorEnvelope>(&body) {
            Ok(envelope) => Err(ProxyError::Api {
                status,
                error: envelope.error,
                error_description: envelope.error_description,
            }),
            Err(_) => Err(ProxyError::Api {
                status,
                error: format!("HTTP {status}"),
                error_description: None,
            }),
        }
    }
}

#[async_trait]
impl ProxyClient for ProxyClientLive {
    async fn ping(&self) -> Result<(), ProxyError> {
        let response = self.client.get(self.endpoint("ping")?).send().await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_group: &str,
        consumer: &str,
        count: u32,
        block_ms: u64,
    ) -> Result<Vec<ConsumedMessage>, ProxyError> {
        let response = self
            .consume_client
            .post(self.endpoint("consume")?)
            .json(&ConsumeRequest {
                queue,
                consumer_group,
                consumer,
                count,
                block_ms,
            })
            .send()
            .await?;
        let response: ConsumeResponse = Self::parse_json(response).await?;
        Ok(response.messages)
    }

    async fn acknowledge(
        &self,
        queue: &str,
        consumer_group: &str,
        message_id: &str,
    ) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.endpoint("acknowledge")?)
            .json(&AcknowledgeRequest {
                queue,
                consumer_group,
                message_id,
            })
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.endpoint("publish")?)
            .json(&PublishRequest { channel, message })
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<JsonValue>, ProxyError> {
        let mut url = self.endpoint("kv")?;
        url.query_pairs_mut().append_pair("key", key);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response: KvGetResponse = Self::parse_json(response).await?;
        Ok(response.value.filter(|v| !v.is_null()))
    }

    async fn kv_set(
        &self,
        key: &str,
        value: JsonValue,
        ttl: Option<Duration>,
    ) -> Result<(), ProxyError> {
        let response = self
            .client
            .post(self.endpoint("kv")?)
            .json(&KvSetRequest {
                key,
                value,
                ttl: ttl.map(|ttl| ttl.as_secs()),
            })
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<(), ProxyError> {
        let mut url = self.endpoint("kv")?;
        url.query_pairs_mut().append_pair("key", key);
        let response = self.client.delete(url).send().await?;
        Self::expect_success(response).await?;
        Ok(())
    }
}
