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

use crate::clients::proxy::ProxyClientLive;
use crate::clients::ws::WsClient;
use crate::config::{JobSourceConfig, UsagePublisherConfig, WorkerExecutorConfig};
use crate::gpu::GpuTracker;
use crate::handler::JobHandler;
use crate::runner::{Runner, RunnerConfig};
use crate::source::JobSource;
use crate::source::proxy::ProxySource;
use crate::source::stream::StreamSource;
use crate::storage::redis::RedisSubstrateStorage;
use crate::stream::StreamWriterFactory;
use crate::stream::proxy::ProxyStreamWriterFactory;
use crate::stream::redis::RedisStreamWriterFactory;
use crate::usage::store::{SqliteUsageStore, StoreUsageRecorder, UsageStore};
use crate::usage::sync::{HttpUsagePublisher, UsageSyncer};
use fleet_common::redis::RedisPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything a running worker is made of, constructed from configuration in
/// dependency order.
pub struct Services {
    pub worker_id: String,
    pub source: Arc<dyn JobSource>,
    pub runner: Arc<Runner>,
    pub usage_store: Arc<dyn UsageStore>,
    pub usage_syncer: Option<Arc<UsageSyncer>>,
    pub websocket: Option<Arc<WsClient>>,
}

impl Services {
    pub async fn new(
        config: &WorkerExecutorConfig,
        handlers: Vec<Arc<dyn JobHandler>>,
    ) -> Result<Services, String> {
        let worker_id = config.resolved_worker_id();
        info!(worker_id, "building worker services");

        let usage_store: Arc<dyn UsageStore> = Arc::new(
            SqliteUsageStore::configured(&config.usage.db)
                .await
                .map_err(|e| e.to_string())?,
        );
        let usage_recorder = Arc::new(StoreUsageRecorder::new(usage_store.clone()));

        let mut websocket: Option<Arc<WsClient>> = None;
        let (source, writer_factory): (Arc<dyn JobSource>, Option<Arc<dyn StreamWriterFactory>>) =
            match &config.source {
                JobSourceConfig::Redis(redis_config) => {
                    let redis = RedisPool::configured(&redis_config.redis)
                        .await
                        .map_err(|e| e.to_string())?;
                    let source = Arc::new(StreamSource::new(
                        Arc::new(RedisSubstrateStorage::new(redis.clone())),
                        worker_id.clone(),
                        config.consume.clone(),
                    ));
                    let factory = config
                        .streaming
                        .then(|| {
                            Arc::new(RedisStreamWriterFactory::new(redis))
                                as Arc<dyn StreamWriterFactory>
                        });
                    (source, factory)
                }
                JobSourceConfig::Proxy(proxy_config) => {
                    let client = Arc::new(
                        ProxyClientLive::new(proxy_config, config.consume.block_timeout)
                            .map_err(|e| e.to_string())?,
                    );
                    if proxy_config.use_websocket {
                        let url = client.websocket_url().map_err(|e| e.to_string())?;
                        websocket = Some(WsClient::start(
                            url,
                            proxy_config.access_token.clone(),
                        ));
                    }
                    let source = Arc::new(ProxySource::new(
                        client.clone(),
                        worker_id.clone(),
                        config.consume.clone(),
                        proxy_config.retries.clone(),
                    ));
                    let factory = config
                        .streaming
                        .then(|| {
                            Arc::new(ProxyStreamWriterFactory::new(client, websocket.clone()))
                                as Arc<dyn StreamWriterFactory>
                        });
                    (source, factory)
                }
            };

        let mut runner = Runner::new(
            source.clone(),
            handlers,
            RunnerConfig {
                worker_id: worker_id.clone(),
                max_concurrency: config.max_concurrency,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
            },
        )
        .with_usage_recorder(usage_recorder);

        if config.gpu_count > 0 {
            runner = runner.with_gpu_tracker(Arc::new(GpuTracker::new(config.gpu_count)));
        }
        if let Some(factory) = writer_factory {
            runner = runner.with_stream_writer_factory(factory);
        }

        let usage_syncer = match &config.usage.publisher {
            UsagePublisherConfig::Http(publisher_config) => {
                let publisher =
                    Arc::new(HttpUsagePublisher::new(publisher_config).map_err(|e| e.to_string())?);
                Some(Arc::new(UsageSyncer::new(
                    usage_store.clone(),
                    publisher,
                    config.usage.sync_interval,
                    config.usage.batch_size,
                )))
            }
            UsagePublisherConfig::Disabled(_) => {
                info!("usage publishing disabled, records are retained locally");
                None
            }
        };

        Ok(Services {
            worker_id,
            source,
            runner: Arc::new(runner),
            usage_store,
            usage_syncer,
            websocket,
        })
    }
}
