// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Peer configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at `/etc/parley/peer.toml`
//! 3. TOML file named by `PARLEY_CONFIG_PATH`
//! 4. `PARLEY_*` environment variables, e.g. `PARLEY_DEFAULT_TIMEOUT_MS=2000`

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    value::{Dict, Map},
    Figment, Metadata, Profile, Provider,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/etc/parley/peer.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PeerConfig {
    /// Timeout applied to calls whose context carries no deadline.
    #[validate(range(min = 1))]
    pub default_timeout_ms: u64,

    /// Maximum number of command handlers running at once.
    #[validate(range(min = 1))]
    pub command_workers: usize,

    /// Maximum number of notification handlers running at once.
    #[validate(range(min = 1))]
    pub session_workers: usize,

    /// Interval between remote session cache sweeps.
    #[validate(range(min = 1))]
    pub prune_interval_ms: u64,

    /// Idle broker channels kept for reuse.
    #[validate(range(min = 1, max = 1024))]
    pub channel_pool_size: usize,

    /// Optional product name, used to tag log lines.
    #[validate(length(max = 64))]
    pub product: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            command_workers: default_workers(),
            session_workers: default_workers(),
            prune_interval_ms: 180_000,
            channel_pool_size: 20,
            product: String::new(),
        }
    }
}

impl PeerConfig {
    pub fn figment() -> Figment {
        let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(PeerConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("PARLEY_").map(|k| k.as_str().to_lowercase().into()))
    }

    /// Load configuration from the default sources.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default sources with a JSON document merged on top.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }
}

impl Provider for PeerConfig {
    fn metadata(&self) -> Metadata {
        Metadata::named("PeerConfig")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        Serialized::defaults(self).data()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
