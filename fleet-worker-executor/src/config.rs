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

use fleet_common::SafeDisplay;
use fleet_common::config::{
    ConfigLoader, DbSqliteConfig, HttpClientConfig, RedisConfig, RetryConfig,
};
use fleet_common::model::{Empty, generated_worker_id};
use fleet_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerExecutorConfig {
    pub tracing: TracingConfig,
    /// Consumer identity within the group; generated when absent.
    pub worker_id: Option<String>,
    pub max_concurrency: usize,
    /// Number of GPU slots to track; 0 disables GPU accounting.
    pub gpu_count: usize,
    /// When disabled, stream events are discarded instead of published.
    pub streaming: bool,
    pub consume: ConsumeConfig,
    pub source: JobSourceConfig,
    pub usage: UsageConfig,
}

impl WorkerExecutorConfig {
    pub fn resolved_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generated_worker_id)
    }
}

impl Default for WorkerExecutorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("worker-executor"),
            worker_id: None,
            max_concurrency: 1,
            gpu_count: 0,
            streaming: true,
            consume: ConsumeConfig::default(),
            source: JobSourceConfig::default(),
            usage: UsageConfig::default(),
        }
    }
}

impl SafeDisplay for WorkerExecutorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "worker id: {}",
            self.worker_id.as_deref().unwrap_or("<generated>")
        );
        let _ = writeln!(&mut result, "max concurrency: {}", self.max_concurrency);
        let _ = writeln!(&mut result, "GPU count: {}", self.gpu_count);
        let _ = writeln!(&mut result, "streaming: {}", self.streaming);
        let _ = writeln!(&mut result, "consume:");
        let _ = writeln!(&mut result, "{}", self.consume.to_safe_string_indented());
        let _ = writeln!(&mut result, "source:");
        let _ = writeln!(&mut result, "{}", self.source.to_safe_string_indented());
        let _ = writeln!(&mut result, "usage:");
        let _ = writeln!(&mut result, "{}", self.usage.to_safe_string_indented());
        result
    }
}

/// Claim-side settings shared by both substrate implementations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsumeConfig {
    pub queues: Vec<String>,
    pub consumer_group: String,
    #[serde(with = "humantime_serde")]
    pub block_timeout: Duration,
    /// Prior deliveries allowed before a message goes to the dead-letter
    /// log; 0 disables dead-lettering.
    pub max_delivery_attempts: u64,
    /// How long a pending delivery must sit idle before another consumer may
    /// re-claim it.
    #[serde(with = "humantime_serde")]
    pub pending_min_idle: Duration,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            queues: vec!["jobs:v1:default".to_string()],
            consumer_group: "fleet-workers".to_string(),
            block_timeout: Duration::from_millis(5000),
            max_delivery_attempts: 3,
            pending_min_idle: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for ConsumeConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "queues: {}", self.queues.join(", "));
        let _ = writeln!(&mut result, "consumer group: {}", self.consumer_group);
        let _ = writeln!(&mut result, "block timeout: {:?}", self.block_timeout);
        let _ = writeln!(
            &mut result,
            "max delivery attempts: {}",
            self.max_delivery_attempts
        );
        let _ = writeln!(&mut result, "pending min idle: {:?}", self.pending_min_idle);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum JobSourceConfig {
    Redis(RedisJobSourceConfig),
    Proxy(ProxyJobSourceConfig),
}

impl Default for JobSourceConfig {
    fn default() -> Self {
        JobSourceConfig::Redis(RedisJobSourceConfig::default())
    }
}

impl SafeDisplay for JobSourceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            JobSourceConfig::Redis(inner) => {
                let _ = writeln!(&mut result, "redis:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            JobSourceConfig::Proxy(inner) => {
                let _ = writeln!(&mut result, "proxy:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
        }
        result
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RedisJobSourceConfig {
    pub redis: RedisConfig,
}

impl SafeDisplay for RedisJobSourceConfig {
    fn to_safe_string(&self) -> String {
        self.redis.to_safe_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyJobSourceConfig {
    pub base_url: Url,
    pub access_token: String,
    /// Keep a persistent websocket to the proxy for stream publishing.
    pub use_websocket: bool,
    pub http_client: HttpClientConfig,
    pub retries: RetryConfig,
}

impl Default for ProxyJobSourceConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:8787").expect("valid default proxy url"),
            access_token: "".to_string(),
            use_websocket: true,
            http_client: HttpClientConfig::default(),
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for ProxyJobSourceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "base url: {}", self.base_url);
        let _ = writeln!(&mut result, "access token: ****");
        let _ = writeln!(&mut result, "use websocket: {}", self.use_websocket);
        let _ = writeln!(&mut result, "http client:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.http_client.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "retries:");
        let _ = writeln!(&mut result, "{}", self.retries.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageConfig {
    pub db: DbSqliteConfig,
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    pub batch_size: usize,
    pub publisher: UsagePublisherConfig,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            db: DbSqliteConfig {
                database: "usage.db".to_string(),
                ..DbSqliteConfig::default()
            },
            sync_interval: Duration::from_secs(60),
            batch_size: 50,
            publisher: UsagePublisherConfig::default(),
        }
    }
}

impl SafeDisplay for UsageConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "db:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "sync interval: {:?}", self.sync_interval);
        let _ = writeln!(&mut result, "batch size: {}", self.batch_size);
        let _ = writeln!(&mut result, "publisher:");
        let _ = writeln!(&mut result, "{}", self.publisher.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum UsagePublisherConfig {
    Http(HttpUsagePublisherConfig),
    Disabled(Empty),
}

impl Default for UsagePublisherConfig {
    fn default() -> Self {
        UsagePublisherConfig::Disabled(Empty {})
    }
}

impl SafeDisplay for UsagePublisherConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            UsagePublisherConfig::Http(inner) => {
                let _ = writeln!(&mut result, "http:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            UsagePublisherConfig::Disabled(_) => {
                let _ = writeln!(&mut result, "disabled");
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpUsagePublisherConfig {
    pub url: Url,
    pub access_token: String,
}

impl SafeDisplay for HttpUsagePublisherConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "url: {}", self.url);
        let _ = writeln!(&mut result, "access token: ****");
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerExecutorConfig> {
    ConfigLoader::new(&PathBuf::from("config/worker-executor.toml"))
}
