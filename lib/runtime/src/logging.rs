// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for all pipeline processes.
//!
//! Output is `READABLE` or `JSONL`; the default is `READABLE`, and `JSONL`
//! can be enabled by setting the `TFDIST_LOG_JSONL` environment variable
//! to `1`. Filters are configured through `TFDIST_LOG` using the usual
//! `tracing` directive syntax (default level: `info`).

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "TFDIST_LOG";

/// ENV enabling JSONL output.
const JSONL_ENV: &str = "TFDIST_LOG_JSONL";

/// Default log level when `TFDIST_LOG` is unset.
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

fn jsonl_enabled() -> bool {
    std::env::var(JSONL_ENV).map(|v| v == "1").unwrap_or(false)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL))
}

/// Initialize the process-wide subscriber. Idempotent; later calls are no-ops
/// so tests may call it freely.
pub fn init() {
    INIT.call_once(|| {
        if jsonl_enabled() {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(layer)
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(layer)
                .init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::debug!("logging initialized twice without panic");
    }
}
