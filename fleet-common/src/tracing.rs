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

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TracingFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub format: TracingFormat,
    pub ansi: bool,
    pub without_time: bool,
    /// Used when `RUST_LOG` is not set; `None` falls back to the default
    /// directive of the chosen `init_tracing_*` entry point.
    pub env_filter: Option<String>,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            format: TracingFormat::Compact,
            ansi: true,
            without_time: false,
            env_filter: None,
        }
    }

    pub fn deployed(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            format: TracingFormat::Json,
            ansi: false,
            without_time: false,
            env_filter: None,
        }
    }

    pub fn test_pretty_without_time(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            format: TracingFormat::Pretty,
            ansi: true,
            without_time: true,
            env_filter: None,
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(format) = std::env::var("FLEET_TRACING_FORMAT") {
            match format.as_str() {
                "compact" => self.format = TracingFormat::Compact,
                "pretty" => self.format = TracingFormat::Pretty,
                "json" => self.format = TracingFormat::Json,
                _ => {}
            }
        }
        if let Ok(filter) = std::env::var("FLEET_TRACING_FILTER") {
            self.env_filter = Some(filter);
        }
        self
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("fleet")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service name: {}", self.service_name);
        let _ = writeln!(&mut result, "format: {:?}", self.format);
        let _ = writeln!(&mut result, "ansi: {}", self.ansi);
        let _ = writeln!(&mut result, "without time: {}", self.without_time);
        let _ = writeln!(
            &mut result,
            "env filter: {}",
            self.env_filter.as_deref().unwrap_or("-")
        );
        result
    }
}

pub fn init_tracing(config: &TracingConfig, default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .env_filter
                .clone()
                .unwrap_or_else(|| default_directive.to_string()),
        )
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_writer(std::io::stderr);

    // `try_init` so repeated initialization in test processes is a no-op
    let _ = match (config.format, config.without_time) {
        (TracingFormat::Compact, false) => builder.compact().try_init(),
        (TracingFormat::Compact, true) => builder.compact().without_time().try_init(),
        (TracingFormat::Pretty, false) => builder.pretty().try_init(),
        (TracingFormat::Pretty, true) => builder.pretty().without_time().try_init(),
        (TracingFormat::Json, false) => builder.json().try_init(),
        (TracingFormat::Json, true) => builder.json().without_time().try_init(),
    };
}

pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    init_tracing(config, "info");
}

pub fn init_tracing_with_default_debug_env_filter(config: &TracingConfig) {
    init_tracing(config, "debug");
}
