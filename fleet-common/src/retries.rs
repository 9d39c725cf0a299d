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

use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};

/// Runs `action` until it succeeds, a non-retriable error is returned, or
/// `config.max_attempts` is exhausted. Delays between attempts follow the
/// retry config's exponential schedule.
pub async fn with_retries<'a, In, F, G, R, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    i: &'a In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    F: for<'b> Fn(&'b In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'b + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1u32;
    loop {
        match action(i).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        target_label,
                        op_label,
                        op_id = ?op_id,
                        attempt,
                        "operation succeeded after retry"
                    );
                }
                break Ok(result);
            }
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    target_label,
                    op_label,
                    op_id = ?op_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => break Err(error),
        }
    }
}
