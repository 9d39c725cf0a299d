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

use crate::clients::proxy::{ProxyClient, ProxyError};
use crate::config::ConsumeConfig;
use crate::model::Job;
use crate::source::{JobSource, SourceError, cancel_key, status_fields, status_key};
use async_trait::async_trait;
use fleet_common::config::RetryConfig;
use fleet_common::retries::with_retries;
use std::sync::Arc;
use tracing::{debug, warn};

const SOURCE_NAME: &str = "proxy";

/// JobSource over the HTTP+WebSocket proxy fronting the same substrate.
///
/// The proxy owns consumer-group mechanics server side (delivery counting
/// and dead-letter routing included), so consuming is a plain long-poll.
/// Status updates and the cancellation flag go through the proxy's KV
/// surface.
pub struct ProxySource {
    client: Arc<dyn ProxyClient>,
    worker_id: String,
    consume: ConsumeConfig,
    retries: RetryConfig,
}

impl ProxySource {
    pub fn new(
        client: Arc<dyn ProxyClient>,
        worker_id: String,
        consume: ConsumeConfig,
        retries: RetryConfig,
    ) -> Self {
        Self {
            client,
            worker_id,
            consume,
            retries,
        }
    }

    async fn set_status(&self, job: &Job, status: &str, error: Option<&str>) {
        let value = serde_json::to_value(status_fields(&self.worker_id, status, error))
            .expect("status fields serialization cannot fail");
        if let Err(error) = self.client.kv_set(&status_key(&job.id), value, None).await {
            warn!(job_id = job.id, "failed to update job status: {error}");
        }
    }
}

#[async_trait]
impl JobSource for ProxySource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn connect(&self) -> Result<(), SourceError> {
        let result: Result<(), ProxyError> = with_retries(
            "proxy",
            "ping",
            None,
            &self.retries,
            &self.client,
            |client| Box::pin(async move { client.ping().await }),
            ProxyError::is_retriable,
        )
        .await;
        result.map_err(SourceError::from)
    }

    async fn next(&self) -> Result<Option<Job>, SourceError> {
        // the server-side block budget is split across the configured queues
        // so one pass stays within a single block timeout
        let per_queue_block_ms = self.consume.block_timeout.as_millis() as u64
            / self.consume.queues.len().max(1) as u64;

        for queue in &self.consume.queues {
            let messages = self
                .client
                .consume(
                    queue,
                    &self.consume.consumer_group,
                    &self.worker_id,
                    1,
                    per_queue_block_ms,
                )
                .await?;

            let Some(message) = messages.into_iter().next() else {
                continue;
            };
            debug!(queue, message_id = message.id, "consumed delivery");

            match Job::from_fields(SOURCE_NAME, queue, &message.id, &message.fields()) {
                Ok(job) => return Ok(Some(job)),
                Err(error) => {
                    // unparseable messages would redeliver forever, drop them
                    warn!(
                        queue,
                        message_id = message.id,
                        "dropping malformed delivery: {error}"
                    );
                    self.client
                        .acknowledge(queue, &self.consume.consumer_group, &message.id)
                        .await?;
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, job: &Job) -> Result<(), SourceError> {
        self.set_status(job, "completed", None).await;

        let result: Result<(), ProxyError> = with_retries(
            "proxy",
            "acknowledge",
            Some(job.id.clone()),
            &self.retries,
            &(
                self.client.clone(),
                job.source_log.clone(),
                self.consume.consumer_group.clone(),
                job.message_id.clone(),
            ),
            |(client, queue, group, message_id)| {
                Box::pin(async move { client.acknowledge(queue, group, message_id).await })
            },
            ProxyError::is_retriable,
        )
        .await;
        result.map_err(SourceError::from)
    }

    async fn nack(&self, job: &Job, error: &str) -> Result<(), SourceError> {
        // no acknowledge here: the claim stays pending on the proxy side so
        // the substrate redelivers it
        self.set_status(job, "failed", Some(error)).await;
        Ok(())
    }

    async fn is_job_cancelled(&self, job_id: &str) -> bool {
        match self.client.kv_get(&cancel_key(job_id)).await {
            Ok(value) => value.is_some(),
            Err(error) => {
                warn!(job_id, "cancellation lookup failed, assuming not cancelled: {error}");
                false
            }
        }
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}
