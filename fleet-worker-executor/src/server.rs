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
use fleet_common::tracing::init_tracing_with_default_env_filter;
use fleet_worker_executor::bootstrap::Services;
use fleet_worker_executor::config::{WorkerExecutorConfig, make_config_loader};
use fleet_worker_executor::handler::JobHandler;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    let config = match make_config_loader().load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Failed to load configuration: {error}");
            std::process::exit(1);
        }
    };

    init_tracing_with_default_env_filter(&config.tracing);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
        .block_on(async_main(config))
}

async fn async_main(config: WorkerExecutorConfig) -> anyhow::Result<()> {
    info!("starting worker executor\n{}", config.to_safe_string());

    // concrete handlers are registered by the embedding deployment; the
    // stock binary runs with an empty registry and nacks everything it
    // cannot route
    let handlers: Vec<Arc<dyn JobHandler>> = Vec::new();
    if handlers.is_empty() {
        warn!("no job handlers registered");
    }

    let services = Services::new(&config, handlers)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    services
        .source
        .connect()
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect job source: {e}"))?;
    info!(
        worker_id = services.worker_id,
        source = services.source.name(),
        "connected to job source"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let syncer_handle = services
        .usage_syncer
        .clone()
        .map(|syncer| syncer.spawn(shutdown.clone()));

    services.runner.run(shutdown.clone()).await;

    if let Some(handle) = syncer_handle {
        let _ = handle.await;
    }
    if let Some(websocket) = &services.websocket {
        websocket.close();
    }
    if let Err(close_error) = services.source.close().await {
        warn!("failed to close job source cleanly: {close_error}");
    }
    services.usage_store.close().await;

    info!("worker executor stopped");
    Ok(())
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(signal_error) = tokio::signal::ctrl_c().await {
            error!("failed to install interrupt handler: {signal_error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(signal_error) => {
                error!("failed to install terminate handler: {signal_error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received, shutting down"),
        _ = terminate => info!("terminate received, shutting down"),
    }
    shutdown.cancel();
}
