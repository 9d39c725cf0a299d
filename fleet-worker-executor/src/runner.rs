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

use crate::gpu::GpuTracker;
use crate::handler::JobHandler;
use crate::model::{ASSIGNED_GPU_KEY, Job, JobResult, ResultStatus};
use crate::source::JobSource;
use crate::stream::{NoopStreamWriter, StreamWriter, StreamWriterFactory};
use crate::usage::{UsageRecord, UsageRecorder, UsageStatus};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CANCELLED_BEFORE_PROCESSING: &str = "Job cancelled before processing";

pub type ActivityCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub worker_id: String,
    /// 0 or 1 means sequential processing.
    pub max_concurrency: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            max_concurrency: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Fetches jobs from the source and drives them through the processing
/// state machine: cancellation gate, handler dispatch, GPU slot accounting,
/// stream events, ack/nack and usage records.
///
/// In-flight jobs run in their own tasks bounded by a semaphore, so a
/// faulting job can never take down the fetch loop or its siblings. Source
/// errors back off exponentially; shutdown lets in-flight jobs finish.
pub struct Runner {
    processor: Arc<JobProcessor>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        source: Arc<dyn JobSource>,
        handlers: Vec<Arc<dyn JobHandler>>,
        config: RunnerConfig,
    ) -> Runner {
        Runner {
            processor: Arc::new(JobProcessor {
                source,
                handlers,
                gpu_tracker: None,
                writer_factory: None,
                activity: None,
                usage: None,
                worker_id: config.worker_id.clone(),
            }),
            config,
        }
    }

    pub fn with_gpu_tracker(mut self, tracker: Arc<GpuTracker>) -> Runner {
        self.processor_mut().gpu_tracker = Some(tracker);
        self
    }

    pub fn with_stream_writer_factory(mut self, factory: Arc<dyn StreamWriterFactory>) -> Runner {
        self.processor_mut().writer_factory = Some(factory);
        self
    }

    pub fn with_activity_callback(mut self, callback: ActivityCallback) -> Runner {
        self.processor_mut().activity = Some(callback);
        self
    }

    pub fn with_usage_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Runner {
        self.processor_mut().usage = Some(recorder);
        self
    }

    fn processor_mut(&mut self) -> &mut JobProcessor {
        Arc::get_mut(&mut self.processor).expect("runner is not shared during construction")
    }

    /// Runs the fetch loop until the token is cancelled, then waits for all
    /// in-flight jobs to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        let concurrent = self.config.max_concurrency > 1;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut backoff = self.config.initial_backoff;

        info!(
            worker_id = self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            source = self.processor.source.name(),
            "runner started"
        );

        loop {
            while let Some(result) = in_flight.try_join_next() {
                log_join_result(result);
            }

            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.processor.source.next() => next,
            };

            let job = match next {
                Ok(Some(job)) => {
                    backoff = self.config.initial_backoff;
                    job
                }
                Ok(None) => {
                    backoff = self.config.initial_backoff;
                    continue;
                }
                Err(source_error) => {
                    warn!(
                        "failed to fetch next job, backing off for {backoff:?}: {source_error}"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    continue;
                }
            };

            let processor = self.processor.clone();
            if concurrent {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                in_flight.spawn(async move {
                    let _permit = permit;
                    processor.process_job(job).await;
                });
            } else {
                // spawned even in sequential mode so a panicking handler
                // cannot tear down the fetch loop
                let result = tokio::spawn(async move { processor.process_job(job).await }).await;
                log_join_result(result);
            }
        }

        while let Some(result) = in_flight.join_next().await {
            log_join_result(result);
        }
        info!(worker_id = self.config.worker_id, "runner stopped");
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(join_error) = result {
        error!("job task failed: {join_error}");
    }
}

struct JobProcessor {
    source: Arc<dyn JobSource>,
    handlers: Vec<Arc<dyn JobHandler>>,
    gpu_tracker: Option<Arc<GpuTracker>>,
    writer_factory: Option<Arc<dyn StreamWriterFactory>>,
    activity: Option<ActivityCallback>,
    usage: Option<Arc<dyn UsageRecorder>>,
    worker_id: String,
}

struct SlotGuard {
    tracker: Arc<GpuTracker>,
    index: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.tracker.release(self.index);
    }
}

impl JobProcessor {
    async fn process_job(&self, mut job: Job) {
        let started_at = Utc::now();
        debug!(job_id = job.id, job_type = job.job_type, "processing job");

        if self.source.is_job_cancelled(&job.id).await {
            info!(job_id = job.id, "job cancelled before processing");
            self.log_activity(&format!("Job {} cancelled before processing", job.id));
            let writer = self.writer(&job);
            if let Err(publish_error) = writer.cancelled(CANCELLED_BEFORE_PROCESSING).await {
                warn!(job_id = job.id, "failed to publish cancelled event: {publish_error}");
            }
            self.record(&job, UsageStatus::Cancelled, started_at, None, None)
                .await;
            if let Err(ack_error) = self.source.ack(&job).await {
                error!(job_id = job.id, "failed to ack cancelled job: {ack_error}");
            }
            return;
        }

        let Some(handler) = self
            .handlers
            .iter()
            .find(|handler| handler.can_handle(&job.job_type))
        else {
            let message = format!("no handler registered for job type {}", job.job_type);
            error!(job_id = job.id, "{message}");
            self.record(
                &job,
                UsageStatus::Failed,
                started_at,
                None,
                Some(&message),
            )
            .await;
            self.nack(&job, &message).await;
            return;
        };

        let mut _slot_guard: Option<SlotGuard> = None;
        if let Some(tracker) = &self.gpu_tracker {
            match job.target_gpu() {
                Some(target) => {
                    let acquired = target >= 0 && tracker.acquire_specific(target as usize);
                    if !acquired {
                        let message = format!("requested GPU {target} is unavailable");
                        warn!(job_id = job.id, "{message}");
                        let writer = self.writer(&job);
                        if let Err(publish_error) = writer.error(&message, false).await {
                            warn!(job_id = job.id, "failed to publish error event: {publish_error}");
                        }
                        self.record(
                            &job,
                            UsageStatus::Failed,
                            started_at,
                            None,
                            Some(&message),
                        )
                        .await;
                        self.nack(&job, &message).await;
                        return;
                    }
                    _slot_guard = Some(SlotGuard {
                        tracker: tracker.clone(),
                        index: target as usize,
                    });
                }
                None => match tracker.acquire() {
                    Some(index) => {
                        _slot_guard = Some(SlotGuard {
                            tracker: tracker.clone(),
                            index,
                        });
                    }
                    None => {
                        let message = "no free GPU slot available".to_string();
                        debug!(job_id = job.id, "{message}");
                        self.record(
                            &job,
                            UsageStatus::Retry,
                            started_at,
                            None,
                            Some(&message),
                        )
                        .await;
                        self.nack(&job, &message).await;
                        return;
                    }
                },
            }
        }
        if let Some(guard) = &_slot_guard {
            job.payload
                .insert(ASSIGNED_GPU_KEY.to_string(), json!(guard.index));
        }

        let writer = self.writer(&job);
        if let Err(publish_error) = writer.start("Job started").await {
            warn!(job_id = job.id, "failed to publish start event: {publish_error}");
        }
        self.log_activity(&format!("Job {} ({}) started", job.id, job.job_type));

        let outcome = handler.execute(&job, writer.clone()).await;

        match outcome {
            Err(handler_error) => {
                let message = format!("{handler_error:#}");
                error!(job_id = job.id, "job failed: {message}");
                self.log_activity(&format!("Job {} failed: {message}", job.id));
                self.record(
                    &job,
                    UsageStatus::Failed,
                    started_at,
                    None,
                    Some(&message),
                )
                .await;
                if let Err(publish_error) = writer.error(&message, false).await {
                    warn!(job_id = job.id, "failed to publish error event: {publish_error}");
                }
                self.nack(&job, &message).await;
            }
            Ok(result) => match result.status {
                ResultStatus::Failure => {
                    let message = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "job failed".to_string());
                    error!(job_id = job.id, "job failed: {message}");
                    self.log_activity(&format!("Job {} failed: {message}", job.id));
                    self.record(
                        &job,
                        UsageStatus::Failed,
                        started_at,
                        Some(&result),
                        Some(&message),
                    )
                    .await;
                    if let Err(publish_error) = writer.error(&message, false).await {
                        warn!(job_id = job.id, "failed to publish error event: {publish_error}");
                    }
                    self.nack(&job, &message).await;
                }
                ResultStatus::Retry => {
                    let message = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "handler requested retry".to_string());
                    info!(job_id = job.id, "job will be retried: {message}");
                    self.log_activity(&format!("Job {} scheduled for retry", job.id));
                    self.record(
                        &job,
                        UsageStatus::Retry,
                        started_at,
                        Some(&result),
                        Some(&message),
                    )
                    .await;
                    self.nack(&job, &message).await;
                }
                ResultStatus::Success => {
                    info!(
                        job_id = job.id,
                        duration_ms = result.duration.as_millis() as u64,
                        "job completed"
                    );
                    self.log_activity(&format!("Job {} completed", job.id));
                    self.record(&job, UsageStatus::Success, started_at, Some(&result), None)
                        .await;
                    if let Err(publish_error) = writer.end(&result.output).await {
                        warn!(job_id = job.id, "failed to publish end event: {publish_error}");
                    }
                    if let Err(ack_error) = self.source.ack(&job).await {
                        error!(job_id = job.id, "failed to ack completed job: {ack_error}");
                    }
                }
            },
        }
    }

    fn writer(&self, job: &Job) -> Arc<dyn StreamWriter> {
        match &self.writer_factory {
            Some(factory) => factory.create(job),
            None => Arc::new(NoopStreamWriter),
        }
    }

    async fn nack(&self, job: &Job, message: &str) {
        if let Err(nack_error) = self.source.nack(job, message).await {
            error!(job_id = job.id, "failed to nack job: {nack_error}");
        }
    }

    async fn record(
        &self,
        job: &Job,
        status: UsageStatus,
        started_at: chrono::DateTime<Utc>,
        result: Option<&JobResult>,
        error: Option<&str>,
    ) {
        if let Some(usage) = &self.usage {
            let record = UsageRecord::from_outcome(
                &self.worker_id,
                job,
                status,
                started_at,
                Utc::now(),
                result,
                error,
            );
            usage.record(record).await;
        }
    }

    fn log_activity(&self, message: &str) {
        if let Some(activity) = &self.activity {
            activity(message);
        }
    }
}
