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

use crate::config::ConsumeConfig;
use crate::model::Job;
use crate::source::{
    JobSource, SourceError, cancel_key, dlq_fields, dlq_log_name, status_fields, status_key,
};
use crate::storage::SubstrateStorage;
use async_trait::async_trait;
use fleet_common::redis::StreamDelivery;
use std::sync::Arc;
use tracing::{debug, warn};

const SOURCE_NAME: &str = "stream";
const PENDING_SCAN_COUNT: usize = 10;

/// Direct consumer-group source over the stream substrate.
///
/// Fresh messages are claimed with a blocking group read fanning in across
/// all configured logs. Messages left pending by a nack (or a dead worker)
/// are re-claimed once their idle time passes the configured threshold; a
/// message whose prior delivery count reached the maximum is routed to the
/// dead-letter log instead of being returned.
pub struct StreamSource {
    storage: Arc<dyn SubstrateStorage>,
    worker_id: String,
    consume: ConsumeConfig,
    block_ms: u64,
    pending_min_idle_ms: u64,
}

impl StreamSource {
    pub fn new(
        storage: Arc<dyn SubstrateStorage>,
        worker_id: String,
        consume: ConsumeConfig,
    ) -> Self {
        let block_ms = consume.block_timeout.as_millis() as u64;
        let pending_min_idle_ms = consume.pending_min_idle.as_millis() as u64;
        Self {
            storage,
            worker_id,
            consume,
            block_ms,
            pending_min_idle_ms,
        }
    }

    /// Re-claims the oldest sufficiently idle pending entry of any consumer
    /// in the group. Returns the claimed delivery together with its prior
    /// delivery count.
    async fn claim_pending(
        &self,
        queue: &str,
    ) -> Result<Option<(StreamDelivery, u64)>, SourceError> {
        let pending = self
            .storage
            .pending(queue, &self.consume.consumer_group, PENDING_SCAN_COUNT)
            .await?;

        for entry in pending {
            if entry.idle_ms < self.pending_min_idle_ms {
                continue;
            }
            let claimed = self
                .storage
                .claim(
                    queue,
                    &self.consume.consumer_group,
                    &self.worker_id,
                    self.pending_min_idle_ms,
                    &entry.message_id,
                )
                .await?;
            if let Some(fields) = claimed {
                debug!(
                    queue,
                    message_id = entry.message_id,
                    delivery_count = entry.delivery_count,
                    "re-claimed pending message"
                );
                return Ok(Some((
                    StreamDelivery {
                        stream: queue.to_string(),
                        message_id: entry.message_id,
                        fields,
                    },
                    entry.delivery_count,
                )));
            }
        }
        Ok(None)
    }

    /// DLQ gate and parsing for a claimed delivery. `prior_deliveries` is the
    /// number of deliveries before this claim, so a fresh read passes 0 and
    /// always reaches the caller.
    async fn accept(
        &self,
        delivery: StreamDelivery,
        prior_deliveries: u64,
    ) -> Result<Option<Job>, SourceError> {
        if self.consume.max_delivery_attempts > 0
            && prior_deliveries >= self.consume.max_delivery_attempts
        {
            let reason = format!(
                "delivery count {prior_deliveries} reached the maximum of {}",
                self.consume.max_delivery_attempts
            );
            let job = Job::from_fields(
                SOURCE_NAME,
                &delivery.stream,
                &delivery.message_id,
                &delivery.fields,
            )
            .ok();
            let fields = dlq_fields(
                &self.worker_id,
                &delivery.stream,
                &delivery.message_id,
                &reason,
                job.as_ref(),
                &delivery.fields,
            );
            self.storage
                .append(&dlq_log_name(&delivery.stream), fields)
                .await?;
            self.storage
                .ack(
                    &delivery.stream,
                    &self.consume.consumer_group,
                    &delivery.message_id,
                )
                .await?;
            warn!(
                queue = delivery.stream,
                message_id = delivery.message_id,
                "message moved to dead-letter log: {reason}"
            );
            return Ok(None);
        }

        match Job::from_fields(
            SOURCE_NAME,
            &delivery.stream,
            &delivery.message_id,
            &delivery.fields,
        ) {
            Ok(job) => Ok(Some(job)),
            Err(error) => {
                // unparseable messages would redeliver forever, drop them
                warn!(
                    queue = delivery.stream,
                    message_id = delivery.message_id,
                    "dropping malformed delivery: {error}"
                );
                self.storage
                    .ack(
                        &delivery.stream,
                        &self.consume.consumer_group,
                        &delivery.message_id,
                    )
                    .await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobSource for StreamSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn connect(&self) -> Result<(), SourceError> {
        for queue in &self.consume.queues {
            self.storage
                .ensure_consumer_group(queue, &self.consume.consumer_group)
                .await?;
        }
        Ok(())
    }

    async fn next(&self) -> Result<Option<Job>, SourceError> {
        for queue in &self.consume.queues {
            if let Some((delivery, prior_deliveries)) = self.claim_pending(queue).await? {
                return self.accept(delivery, prior_deliveries).await;
            }
        }

        let delivery = self
            .storage
            .read_group_next(
                &self.consume.consumer_group,
                &self.worker_id,
                self.block_ms,
                &self.consume.queues,
            )
            .await?;
        match delivery {
            Some(delivery) => self.accept(delivery, 0).await,
            None => Ok(None),
        }
    }

    async fn ack(&self, job: &Job) -> Result<(), SourceError> {
        self.storage
            .hash_set(
                &status_key(&job.id),
                status_fields(&self.worker_id, "completed", None),
            )
            .await?;
        self.storage
            .ack(&job.source_log, &self.consume.consumer_group, &job.message_id)
            .await?;
        Ok(())
    }

    async fn nack(&self, job: &Job, error: &str) -> Result<(), SourceError> {
        // no ack here: the claim stays pending so the group redelivers it
        self.storage
            .hash_set(
                &status_key(&job.id),
                status_fields(&self.worker_id, "failed", Some(error)),
            )
            .await?;
        Ok(())
    }

    async fn is_job_cancelled(&self, job_id: &str) -> bool {
        match self.storage.key_exists(&cancel_key(job_id)).await {
            Ok(cancelled) => cancelled,
            Err(error) => {
                warn!(job_id, "cancellation lookup failed, assuming not cancelled: {error}");
                false
            }
        }
    }

    async fn close(&self) -> Result<(), SourceError> {
        self.storage.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use crate::storage::memory::InMemorySubstrateStorage;
    use fleet_common::redis::PendingEntry;
    use std::collections::HashMap;
    use std::time::Duration;
    use test_r::test;

    const GROUP: &str = "workers";

    fn consume_config(queues: &[&str], max_delivery_attempts: u64) -> ConsumeConfig {
        ConsumeConfig {
            queues: queues.iter().map(|q| q.to_string()).collect(),
            consumer_group: GROUP.to_string(),
            block_timeout: Duration::from_millis(10),
            max_delivery_attempts,
            pending_min_idle: Duration::from_millis(500),
        }
    }

    fn source_over(
        storage: Arc<InMemorySubstrateStorage>,
        queues: &[&str],
        max_delivery_attempts: u64,
    ) -> StreamSource {
        StreamSource::new(
            storage,
            "w1".to_string(),
            consume_config(queues, max_delivery_attempts),
        )
    }

    fn job_fields(job_id: &str, job_type: &str, enqueued_at: Option<&str>) -> Vec<(String, String)> {
        let mut fields = vec![
            ("jobId".to_string(), job_id.to_string()),
            ("type".to_string(), job_type.to_string()),
            ("payload".to_string(), r#"{"k":"v"}"#.to_string()),
        ];
        if let Some(enqueued_at) = enqueued_at {
            fields.push(("enqueuedAt".to_string(), enqueued_at.to_string()));
        }
        fields
    }

    #[test]
    async fn fresh_delivery_is_claimed_parsed_and_acked() {
        let storage = Arc::new(InMemorySubstrateStorage::new());
        storage.enqueue("jobs:v1:t", job_fields("J1", "TEST", None));
        let source = source_over(storage.clone(), &["jobs:v1:t"], 3);
        source.connect().await.unwrap();

        let job = source.next().await.unwrap().unwrap();
        assert_eq!(job.id, "J1");
        assert_eq!(job.job_type, "TEST");
        assert_eq!(job.source_log, "jobs:v1:t");
        assert_eq!(storage.pending_count("jobs:v1:t", GROUP), 1);

        source.ack(&job).await.unwrap();
        assert_eq!(storage.pending_count("jobs:v1:t", GROUP), 0);

        let status = storage.hash("job:J1:status").unwrap();
        assert_eq!(status["status"], "completed");
        assert_eq!(status["worker_id"], "w1");
        assert!(status.contains_key("updated_at"));
    }

    #[test]
    async fn nack_records_failure_but_leaves_the_claim_pending() {
        let storage = Arc::new(InMemorySubstrateStorage::new());
        storage.enqueue("jobs:v1:t", job_fields("J2", "TEST", None));
        let source = source_over(storage.clone(), &["jobs:v1:t"], 3);

        let job = source.next().await.unwrap().unwrap();
        source.nack(&job, "backend exploded").await.unwrap();

        assert_eq!(storage.pending_count("jobs:v1:t", GROUP), 1);
        let status = storage.hash("job:J2:status").unwrap();
        assert_eq!(status["status"], "failed");
        assert_eq!(status["error"], "backend exploded");

        // the claim is not idle long enough to re-claim yet
        assert!(source.next().await.unwrap().is_none());
        assert_eq!(storage.pending_count("jobs:v1:t", GROUP), 1);
    }

    #[test]
    async fn idle_claims_are_redelivered_below_the_attempt_cap() {
        let storage = Arc::new(InMemorySubstrateStorage::new());
        storage.enqueue("jobs:v1:t", job_fields("J3", "TEST", None));
        let source = source_over(storage.clone(), &["jobs:v1:t"], 3);

        let first = source.next().await.unwrap().unwrap();
        source.nack(&first, "first attempt failed").await.unwrap();
        storage.advance_time(1000);

        let second = source.next().await.unwrap().unwrap();
        assert_eq!(second.id, "J3");
        assert_eq!(second.message_id, first.message_id);
        assert!(storage.stream_entries("dlq:v1:t").is_empty());
    }

    #[test]
    async fn exhausted_deliveries_are_dead_lettered_with_the_producer_timestamp() {
        let storage = Arc::new(InMemorySubstrateStorage::new());
        storage.enqueue(
            "jobs:v1:t",
            job_fields("J3", "FAIL", Some("2025-01-15T12:00:00Z")),
        );
        let source = source_over(storage.clone(), &["jobs:v1:t"], 1);
        source.connect().await.unwrap();

        // first delivery reaches the caller and fails
        let job = source.next().await.unwrap().unwrap();
        assert_eq!(job.id, "J3");
        source.nack(&job, "handler failed").await.unwrap();
        storage.advance_time(1000);

        // second claim hits the attempt cap and is dead-lettered
        assert!(source.next().await.unwrap().is_none());

        let dlq = storage.stream_entries("dlq:v1:t");
        assert_eq!(dlq.len(), 1);
        let entry = &dlq[0].1;
        assert_eq!(entry["enqueuedAt"], "2025-01-15T12:00:00Z");
        assert_eq!(entry["original_queue"], "jobs:v1:t");
        assert_eq!(entry["original_message_id"], job.message_id);
        assert_eq!(entry["jobId"], "J3");
        assert_eq!(entry["worker_id"], "w1");
        assert_eq!(entry["payload"], r#"{"k":"v"}"#);

        // the original is acked: no pending entries remain
        assert_eq!(storage.pending_count("jobs:v1:t", GROUP), 0);
        assert!(storage.stream_entries("jobs:v1:t").is_empty());
    }

    #[test]
    async fn fan_in_returns_the_producing_log_and_acks_it_specifically() {
        let storage = Arc::new(InMemorySubstrateStorage::new());
        storage.enqueue("jobs:v1:l2", job_fields("J4", "TEST", None));
        let source = source_over(storage.clone(), &["jobs:v1:l1", "jobs:v1:l2"], 3);
        source.connect().await.unwrap();

        let job = source.next().await.unwrap().unwrap();
        assert_eq!(job.id, "J4");
        assert_eq!(job.source_log, "jobs:v1:l2");

        source.ack(&job).await.unwrap();
        assert_eq!(storage.pending_count("jobs:v1:l2", GROUP), 0);
        assert_eq!(storage.pending_count("jobs:v1:l1", GROUP), 0);
        assert!(storage.stream_entries("jobs:v1:l1").is_empty());
    }

    #[test]
    async fn malformed_deliveries_are_acked_and_dropped() {
        let storage = Arc::new(InMemorySubstrateStorage::new());
        storage.enqueue(
            "jobs:v1:t",
            vec![("type".to_string(), "TEST".to_string())],
        );
        let source = source_over(storage.clone(), &["jobs:v1:t"], 3);

        assert!(source.next().await.unwrap().is_none());
        assert_eq!(storage.pending_count("jobs:v1:t", GROUP), 0);
        assert!(storage.stream_entries("jobs:v1:t").is_empty());
    }

    #[test]
    async fn cancellation_flag_is_a_key_lookup() {
        let storage = Arc::new(InMemorySubstrateStorage::new());
        storage.set_key("job:cancelled:J9");
        let source = source_over(storage, &["jobs:v1:t"], 3);

        assert!(source.is_job_cancelled("J9").await);
        assert!(!source.is_job_cancelled("J8").await);
    }

    struct FailingStorage;

    #[async_trait]
    impl SubstrateStorage for FailingStorage {
        async fn ensure_consumer_group(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn read_group_next(
            &self,
            _: &str,
            _: &str,
            _: u64,
            _: &[String],
        ) -> Result<Option<StreamDelivery>, StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn ack(&self, _: &str, _: &str, _: &str) -> Result<u64, StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn append(
            &self,
            _: &str,
            _: Vec<(String, String)>,
        ) -> Result<String, StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn pending(
            &self,
            _: &str,
            _: &str,
            _: usize,
        ) -> Result<Vec<PendingEntry>, StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn claim(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: u64,
            _: &str,
        ) -> Result<Option<HashMap<String, String>>, StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn key_exists(&self, _: &str) -> Result<bool, StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn hash_set(
            &self,
            _: &str,
            _: HashMap<String, String>,
        ) -> Result<(), StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }

        async fn close(&self) -> Result<(), StorageError> {
            Err(StorageError::Internal("down".to_string()))
        }
    }

    #[test]
    async fn cancellation_check_fails_open_on_lookup_errors() {
        let source = source_over_failing();
        assert!(!source.is_job_cancelled("J1").await);
    }

    #[test]
    async fn transport_errors_bubble_out_of_next() {
        let source = source_over_failing();
        assert!(source.next().await.is_err());
    }

    fn source_over_failing() -> StreamSource {
        StreamSource::new(
            Arc::new(FailingStorage),
            "w1".to_string(),
            consume_config(&["jobs:v1:t"], 3),
        )
    }
}
