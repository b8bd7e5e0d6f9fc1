// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `tfdist-builder` process entry point.
//!
//! Built TimeFrames are handed to the downstream channel; the downstream
//! consumer is deployment-specific, this binary drains and accounts them.

use clap::Parser;
use std::sync::Arc;

use tfdist_builder::BuilderService;
use tfdist_runtime::discovery::MemoryStore;
use tfdist_runtime::{RuntimeConfig, exit_code, logging};

#[derive(Parser, Debug)]
#[command(name = "tfdist-builder", about = "TimeFrame builder")]
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
    let (downstream_tx, mut downstream_rx) = tokio::sync::mpsc::channel(64);

    let handle = match BuilderService::start(config, kv, downstream_tx).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(error = %err, "builder startup failed");
            std::process::exit(exit_code::TRANSPORT_SETUP);
        }
    };

    // drain built TimeFrames
    tokio::spawn(async move {
        let mut built: u64 = 0;
        while let Some(tf) = downstream_rx.recv().await {
            built += 1;
            tracing::info!(tf_id = tf.id(), size = tf.data_size(), total = built, "TimeFrame delivered");
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "signal wait failed");
    }
    handle.shutdown().await;
    std::process::exit(exit_code::CLEAN);
}
