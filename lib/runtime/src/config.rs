// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! Loaded from, in increasing priority:
//!   1. Built-in defaults.
//!   2. Optional TOML file pointed to by the `TFDIST_CONFIG_PATH` environment
//!      variable.
//!   3. `TFDIST_*` environment variables.
//!
//! Every tunable of the pipeline lives here; components pick the fields they
//! need. Durations are configured in milliseconds.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Result, raise};

/// ENV pointing at an optional TOML configuration file.
const CONFIG_PATH_ENV: &str = "TFDIST_CONFIG_PATH";

/// Prefix for environment-variable overrides.
const ENV_PREFIX: &str = "TFDIST_";

/// Data-plane flavor selected at configuration time.
///
/// `Rma` uses one-sided remote reads against registered regions; `Copy` is
/// the fallback that pushes payload bytes over the tagged control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataPlaneMode {
    #[default]
    Rma,
    Copy,
}

impl fmt::Display for DataPlaneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rma => write!(f, "rma"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

impl FromStr for DataPlaneMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rma" => Ok(Self::Rma),
            "copy" | "fallback" => Ok(Self::Copy),
            _ => Err(crate::error!(
                "invalid data plane mode: '{s}'. Valid options are: 'rma', 'copy'"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Partition this process belongs to.
    pub partition_id: String,

    /// Process id unique within the partition (e.g. `sender-epn001`).
    pub process_id: String,

    /// Data-plane flavor.
    pub data_plane: DataPlaneMode,

    /// Bind address of the control RPC endpoint.
    pub rpc_bind: String,

    /// Builders: bind address of the data-plane listener.
    pub data_bind: String,

    /// Scheduler: how long a Gathering TF waits for the full sender set.
    pub gather_deadline_ms: u64,

    /// Scheduler: heartbeat silence after which a builder is declared dead.
    pub builder_dead_after_ms: u64,

    /// Heartbeat period for senders and builders.
    pub heartbeat_interval_ms: u64,

    /// Builder: maximum concurrent one-sided reads per sender peer.
    pub per_sender_fetch_concurrency: usize,

    /// Scheduler: how long to keep retrying sender discovery at startup.
    pub discovery_timeout_ms: u64,

    /// Bounded grace period for draining in-flight TFs on terminate.
    pub drain_grace_ms: u64,

    /// Sender: how long a fetched TF may wait for the builder's DONE ack.
    pub fetch_ack_timeout_ms: u64,

    /// Size of the registered data region, bytes.
    pub region_size: u64,

    /// Builder admission capacity, bytes.
    pub builder_capacity: u64,

    /// Control-channel retry budget for transient failures.
    pub control_retry_attempts: u32,

    /// Largest accepted control/metadata frame, bytes.
    pub max_frame_size: usize,

    /// Keep the first part of each equipment even when its payload is empty.
    pub keep_first_empty_part: bool,

    /// Scheduler: the full sender set of the partition. Completeness of a
    /// TimeFrame is measured against this list.
    pub stf_sender_ids: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            partition_id: "default".to_string(),
            process_id: String::new(),
            data_plane: DataPlaneMode::Rma,
            rpc_bind: "127.0.0.1:0".to_string(),
            data_bind: "127.0.0.1:0".to_string(),
            gather_deadline_ms: 500,
            builder_dead_after_ms: 10_000,
            heartbeat_interval_ms: 1_000,
            per_sender_fetch_concurrency: 4,
            discovery_timeout_ms: 5 * 60 * 1_000,
            drain_grace_ms: 5_000,
            fetch_ack_timeout_ms: 30_000,
            region_size: 256 << 20,
            builder_capacity: 128 << 20,
            control_retry_attempts: 3,
            max_frame_size: 64 << 20,
            keep_first_empty_part: true,
            stf_sender_ids: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load the configuration from defaults, the optional TOML file and the
    /// `TFDIST_*` environment.
    pub fn from_settings() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RuntimeConfig::default()));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }

        let config: RuntimeConfig = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| crate::error!("failed to load configuration: {e}"))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition_id.is_empty() {
            raise!("partition_id must not be empty");
        }
        if self.per_sender_fetch_concurrency == 0 {
            raise!("per_sender_fetch_concurrency must be at least 1");
        }
        if self.region_size == 0 {
            raise!("region_size must be non-zero");
        }
        if self.max_frame_size < 4096 {
            raise!("max_frame_size too small: {}", self.max_frame_size);
        }
        Ok(())
    }

    pub fn gather_deadline(&self) -> Duration {
        Duration::from_millis(self.gather_deadline_ms)
    }

    pub fn builder_dead_after(&self) -> Duration {
        Duration::from_millis(self.builder_dead_after_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn fetch_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gather_deadline(), Duration::from_millis(500));
        assert_eq!(config.builder_dead_after(), Duration::from_secs(10));
        assert_eq!(config.per_sender_fetch_concurrency, 4);
    }

    #[test]
    fn test_data_plane_mode_from_str() {
        assert_eq!("rma".parse::<DataPlaneMode>().unwrap(), DataPlaneMode::Rma);
        assert_eq!("copy".parse::<DataPlaneMode>().unwrap(), DataPlaneMode::Copy);
        assert_eq!(
            "fallback".parse::<DataPlaneMode>().unwrap(),
            DataPlaneMode::Copy
        );
        assert!("ucx".parse::<DataPlaneMode>().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let config = RuntimeConfig {
            per_sender_fetch_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
