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

use async_trait::async_trait;
use fleet_worker_executor::handler::JobHandler;
use fleet_worker_executor::model::{Job, JobPayload, JobResult};
use fleet_worker_executor::source::{JobSource, SourceError};
use fleet_worker_executor::stream::{
    StreamError, StreamEvent, StreamEventType, StreamWriter, StreamWriterFactory,
};
use fleet_worker_executor::storage::StorageError;
use fleet_worker_executor::usage::{UsageRecord, UsageRecorder};
use serde_json::Value as JsonValue;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_job(id: &str, job_type: &str) -> Job {
    Job {
        id: id.to_string(),
        job_type: job_type.to_string(),
        payload: JobPayload::new(),
        source: "memory".to_string(),
        message_id: format!("{id}-msg"),
        source_log: "jobs:v1:t".to_string(),
        ray_id: None,
        enqueued_at: None,
    }
}

pub fn test_job_with(id: &str, job_type: &str, payload: &[(&str, JsonValue)]) -> Job {
    let mut job = test_job(id, job_type);
    job.payload = payload
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    job
}

/// In-process job source: a queue of jobs, with recorded acks and nacks and
/// optional injected fetch errors.
pub struct InMemorySource {
    jobs: Mutex<VecDeque<Job>>,
    pub acked: Mutex<Vec<String>>,
    pub nacked: Mutex<Vec<(String, String)>>,
    pub cancelled: Mutex<HashSet<String>>,
    errors_to_inject: AtomicUsize,
    pub next_calls: AtomicUsize,
}

impl InMemorySource {
    pub fn new(jobs: Vec<Job>) -> Arc<InMemorySource> {
        Arc::new(InMemorySource {
            jobs: Mutex::new(jobs.into_iter().collect()),
            acked: Mutex::new(Vec::new()),
            nacked: Mutex::new(Vec::new()),
            cancelled: Mutex::new(HashSet::new()),
            errors_to_inject: AtomicUsize::new(0),
            next_calls: AtomicUsize::new(0),
        })
    }

    pub fn inject_errors(&self, count: usize) {
        self.errors_to_inject.store(count, Ordering::SeqCst);
    }

    pub fn mark_cancelled(&self, job_id: &str) {
        self.cancelled.lock().unwrap().insert(job_id.to_string());
    }

    pub fn acked_ids(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn nacked_ids(&self) -> Vec<String> {
        self.nacked
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.acked.lock().unwrap().len() + self.nacked.lock().unwrap().len()
    }
}

#[async_trait]
impl JobSource for InMemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn next(&self) -> Result<Option<Job>, SourceError> {
        self.next_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .errors_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
        {
            return Err(SourceError::Storage(StorageError::Internal(
                "injected transport error".to_string(),
            )));
        }

        let job = self.jobs.lock().unwrap().pop_front();
        match job {
            Some(job) => Ok(Some(job)),
            None => {
                // quiet queue: simulate a short block timeout
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(None)
            }
        }
    }

    async fn ack(&self, job: &Job) -> Result<(), SourceError> {
        self.acked.lock().unwrap().push(job.id.clone());
        Ok(())
    }

    async fn nack(&self, job: &Job, error: &str) -> Result<(), SourceError> {
        self.nacked
            .lock()
            .unwrap()
            .push((job.id.clone(), error.to_string()));
        Ok(())
    }

    async fn is_job_cancelled(&self, job_id: &str) -> bool {
        self.cancelled.lock().unwrap().contains(job_id)
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Stream writer that records every event instead of publishing it.
pub struct RecordingStreamWriter {
    job_id: String,
    ray_id: Option<String>,
    chunk_index: AtomicU64,
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

#[async_trait]
impl StreamWriter for RecordingStreamWriter {
    async fn start(&self, message: &str) -> Result<(), StreamError> {
        self.push(StreamEventType::Start, json!({"message": message}));
        Ok(())
    }

    async fn chunk(&self, content: JsonValue) -> Result<(), StreamError> {
        let index = self.chunk_index.fetch_add(1, Ordering::SeqCst);
        self.push(
            StreamEventType::Chunk,
            json!({"content": content, "index": index}),
        );
        Ok(())
    }

    async fn end(&self, result: &HashMap<String, JsonValue>) -> Result<(), StreamError> {
        self.push(StreamEventType::End, json!({"result": result}));
        Ok(())
    }

    async fn error(&self, error: &str, recoverable: bool) -> Result<(), StreamError> {
        self.push(
            StreamEventType::Error,
            json!({"error": error, "recoverable": recoverable}),
        );
        Ok(())
    }

    async fn cancelled(&self, reason: &str) -> Result<(), StreamError> {
        self.push(StreamEventType::Cancelled, json!({"reason": reason}));
        Ok(())
    }
}

impl RecordingStreamWriter {
    fn push(&self, event_type: StreamEventType, data: JsonValue) {
        self.events.lock().unwrap().push(StreamEvent::new(
            event_type,
            &self.job_id,
            self.ray_id.as_deref(),
            data,
        ));
    }
}

#[derive(Clone, Default)]
pub struct RecordingStreamWriterFactory {
    events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl RecordingStreamWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, job_id: &str) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.job_id == job_id)
            .cloned()
            .collect()
    }
}

impl StreamWriterFactory for RecordingStreamWriterFactory {
    fn create(&self, job: &Job) -> Arc<dyn StreamWriter> {
        Arc::new(RecordingStreamWriter {
            job_id: job.id.clone(),
            ray_id: job.ray_id.clone(),
            chunk_index: AtomicU64::new(0),
            events: self.events.clone(),
        })
    }
}

#[derive(Default)]
pub struct RecordingUsageRecorder {
    pub records: Mutex<Vec<UsageRecord>>,
}

impl RecordingUsageRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses_for(&self, job_id: &str) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.job_id == job_id)
            .map(|record| record.status.to_string())
            .collect()
    }
}

#[async_trait]
impl UsageRecorder for RecordingUsageRecorder {
    async fn record(&self, record: UsageRecord) {
        self.records.lock().unwrap().push(record);
    }
}

type HandlerResult = Box<dyn Fn(&Job) -> anyhow::Result<JobResult> + Send + Sync>;

/// Configurable handler: accepts one job type, sleeps for an optional delay,
/// tracks invocation concurrency and produces a configured outcome.
pub struct FakeHandler {
    job_type: String,
    delay: Option<Duration>,
    hold: Option<tokio_util::sync::CancellationToken>,
    outcome: HandlerResult,
    pub invoked: AtomicUsize,
    pub seen_jobs: Mutex<Vec<Job>>,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
    pub chunks: Vec<JsonValue>,
}

impl FakeHandler {
    pub fn succeeding(job_type: &str, output: &[(&str, JsonValue)]) -> Arc<FakeHandler> {
        let output: HashMap<String, JsonValue> = output
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Self::new(job_type, None, move |_| {
            Ok(JobResult::success(output.clone(), Duration::from_millis(1)))
        })
    }

    pub fn failing(job_type: &str, error: &str) -> Arc<FakeHandler> {
        let error = error.to_string();
        Self::new(job_type, None, move |_| {
            Ok(JobResult::failure(error.clone(), Duration::from_millis(1)))
        })
    }

    pub fn retrying(job_type: &str, error: &str) -> Arc<FakeHandler> {
        let error = error.to_string();
        Self::new(job_type, None, move |_| {
            Ok(JobResult::retry(error.clone(), Duration::from_millis(1)))
        })
    }

    pub fn erroring(job_type: &str, error: &str) -> Arc<FakeHandler> {
        let error = error.to_string();
        Self::new(job_type, None, move |_| Err(anyhow::anyhow!(error.clone())))
    }

    pub fn sleeping(job_type: &str, delay: Duration) -> Arc<FakeHandler> {
        Self::new(job_type, Some(delay), |_| {
            Ok(JobResult::success(HashMap::new(), Duration::from_millis(1)))
        })
    }

    /// Succeeds only once the given token is cancelled; lets tests hold a
    /// job in flight deterministically.
    pub fn holding(
        job_type: &str,
        release: tokio_util::sync::CancellationToken,
    ) -> Arc<FakeHandler> {
        let mut handler = Self::new(job_type, None, |_| {
            Ok(JobResult::success(HashMap::new(), Duration::from_millis(1)))
        });
        Arc::get_mut(&mut handler)
            .expect("handler is not shared yet")
            .hold = Some(release);
        handler
    }

    pub fn with_chunks(mut self: Arc<FakeHandler>, chunks: Vec<JsonValue>) -> Arc<FakeHandler> {
        Arc::get_mut(&mut self)
            .expect("handler is not shared yet")
            .chunks = chunks;
        self
    }

    fn new(
        job_type: &str,
        delay: Option<Duration>,
        outcome: impl Fn(&Job) -> anyhow::Result<JobResult> + Send + Sync + 'static,
    ) -> Arc<FakeHandler> {
        Arc::new(FakeHandler {
            job_type: job_type.to_string(),
            delay,
            hold: None,
            outcome: Box::new(outcome),
            invoked: AtomicUsize::new(0),
            seen_jobs: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            chunks: Vec::new(),
        })
    }

    pub fn invocations(&self) -> usize {
        self.invoked.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FakeHandler {
    fn can_handle(&self, job_type: &str) -> bool {
        self.job_type == job_type
    }

    async fn execute(
        &self,
        job: &Job,
        stream: Arc<dyn StreamWriter>,
    ) -> anyhow::Result<JobResult> {
        self.invoked.fetch_add(1, Ordering::SeqCst);
        self.seen_jobs.lock().unwrap().push(job.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);

        for chunk in &self.chunks {
            let _ = stream.chunk(chunk.clone()).await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(release) = &self.hold {
            release.cancelled().await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.outcome)(job)
    }
}

/// Polls `condition` until it holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
