// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `tfdist-sender` process entry point.
//!
//! The readout source feeding the intake channel is deployment-specific;
//! this binary wires an idle channel and exists for operational plumbing
//! (config validation, endpoint publication, heartbeats).

use clap::Parser;
use std::sync::Arc;

use tfdist_runtime::discovery::MemoryStore;
use tfdist_runtime::{RuntimeConfig, exit_code, logging};
use tfdist_sender::SenderService;

#[derive(Parser, Debug)]
#[command(name = "tfdist-sender", about = "STF sender")]
struct Args {
    /// Partition to join.
    #[arg(long, env = "TFDIST_PARTITION_ID")]
    partition: Option<String>,

    /// Process id unique within the partition.
    #[arg(long, env = "TFDIST_PROCESS_ID")]
    id: Option<String>,
}

#[tokio::main]
async fn main() {
    logging::init();
    let args = Args::parse();

    let mut config = match RuntimeConfig::from_settings() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(exit_code::CONFIG);
        }
    };
    if let Some(partition) = args.partition {
        config.partition_id = partition;
    }
    if let Some(id) = args.id {
        config.process_id = id;
    }

    let kv = Arc::new(MemoryStore::new());
    let (_source_tx, source_rx) = tokio::sync::mpsc::channel(64);

    let handle = match SenderService::start(config, kv, source_rx).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(error = %err, "sender startup failed");
            std::process::exit(exit_code::TRANSPORT_SETUP);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "signal wait failed");
    }
    handle.shutdown().await;
    std::process::exit(exit_code::CLEAN);
}
