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

use crate::clients::proxy::ProxyClient;
use crate::clients::ws::WsClient;
use crate::model::Job;
use crate::stream::{
    JobStreamIdentity, StreamError, StreamEvent, StreamEventType, StreamWriter,
    StreamWriterFactory,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Publishes stream events through the proxy, preferring the persistent
/// websocket and falling back to the HTTP publish endpoint while the socket
/// is down.
pub struct ProxyStreamWriter {
    client: Arc<dyn ProxyClient>,
    ws: Option<Arc<WsClient>>,
    identity: JobStreamIdentity,
}

impl ProxyStreamWriter {
    pub fn new(client: Arc<dyn ProxyClient>, ws: Option<Arc<WsClient>>, job: &Job) -> Self {
        Self {
            client,
            ws,
            identity: JobStreamIdentity::for_job(job),
        }
    }

    async fn publish(&self, event: StreamEvent) -> Result<(), StreamError> {
        let text = event.to_json();
        if let Some(ws) = &self.ws {
            if ws.is_connected() && ws.publish(&self.identity.channel, &text) {
                return Ok(());
            }
        }
        self.client
            .publish(&self.identity.channel, &text)
            .await
            .map_err(StreamError::from)
    }
}

#[async_trait]
impl StreamWriter for ProxyStreamWriter {
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

pub struct ProxyStreamWriterFactory {
    client: Arc<dyn ProxyClient>,
    ws: Option<Arc<WsClient>>,
}

impl ProxyStreamWriterFactory {
    pub fn new(client: Arc<dyn ProxyClient>, ws: Option<Arc<WsClient>>) -> Self {
        Self { client, ws }
    }
}

impl StreamWriterFactory for ProxyStreamWriterFactory {
    fn create(&self, job: &Job) -> Arc<dyn StreamWriter> {
        Arc::new(ProxyStreamWriter::new(
            self.client.clone(),
            self.ws.clone(),
            job,
        ))
    }
}
