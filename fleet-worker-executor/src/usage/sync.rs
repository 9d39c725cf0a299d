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

use crate::config::HttpUsagePublisherConfig;
use crate::usage::UsageRecord;
use crate::usage::store::{UsageError, UsageStore};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Destination of drained usage batches. Publication is at-least-once: a
/// batch may be re-sent when marking it synced fails afterwards, so the
/// consumer must deduplicate on job id.
#[async_trait]
pub trait UsagePublisher: Send + Sync {
    async fn publish(&self, records: &[UsageRecord]) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct UsageBatch<'a> {
    records: &'a [UsageRecord],
}

/// Posts usage batches as JSON to an HTTP collector.
pub struct HttpUsagePublisher {
    client: reqwest::Client,
    url: Url,
}

impl HttpUsagePublisher {
    pub fn new(config: &HttpUsagePublisherConfig) -> anyhow::Result<HttpUsagePublisher> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.access_token))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpUsagePublisher {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl UsagePublisher for HttpUsagePublisher {
    async fn publish(&self, records: &[UsageRecord]) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&UsageBatch { records })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("usage collector returned HTTP {status}");
        }
        Ok(())
    }
}

/// Background drain loop: every interval it reads a batch of unsynced
/// records, hands them to the publisher and only marks them synced when the
/// publish succeeded. Failed batches stay unsynced and retry next tick.
pub struct UsageSyncer {
    store: Arc<dyn UsageStore>,
    publisher: Arc<dyn UsagePublisher>,
    interval: Duration,
    batch_size: usize,
}

impl UsageSyncer {
    pub fn new(
        store: Arc<dyn UsageStore>,
        publisher: Arc<dyn UsagePublisher>,
        interval: Duration,
        batch_size: usize,
    ) -> UsageSyncer {
        UsageSyncer {
            store,
            publisher,
            interval,
            batch_size,
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                batch_size = self.batch_size,
                "usage syncer started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = self.sync_once().await {
                            warn!("usage sync failed: {error}");
                        }
                    }
                }
            }
            info!("usage syncer stopped");
        })
    }

    /// One drain pass; returns how many records were synced.
    pub async fn sync_once(&self) -> Result<usize, UsageError> {
        let rows = self.store.query_unsynced(self.batch_size).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let records: Vec<UsageRecord> = rows
            .into_iter()
            .filter_map(|row| match UsageRecord::try_from(row) {
                Ok(record) => Some(record),
                Err(error) => {
                    warn!("skipping corrupt usage row: {error}");
                    None
                }
            })
            .collect();

        match self.publisher.publish(&records).await {
            Ok(()) => {
                self.store.mark_synced(&ids).await?;
                debug!(count = ids.len(), "usage records synced");
                Ok(ids.len())
            }
            Err(error) => {
                warn!(
                    count = ids.len(),
                    "usage publish failed, records kept for next tick: {error}"
                );
                Ok(0)
            }
        }
    }
}
