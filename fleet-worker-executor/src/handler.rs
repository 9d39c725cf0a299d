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

use crate::model::{Job, JobResult};
use crate::stream::StreamWriter;
use async_trait::async_trait;
use std::sync::Arc;

/// Dispatch target for a family of job types.
///
/// Handlers are pure from the runner's point of view: given a job and a
/// stream writer they produce a `JobResult`. The runner owns scheduling, GPU
/// slots, acknowledgement and usage accounting; handlers must not touch any
/// of those. A handler returning `Err` is treated like a failed result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Whether this handler accepts the given job type. The runner picks the
    /// first matching handler in registration order.
    fn can_handle(&self, job_type: &str) -> bool;

    async fn execute(
        &self,
        job: &Job,
        stream: Arc<dyn StreamWriter>,
    ) -> anyhow::Result<JobResult>;
}
