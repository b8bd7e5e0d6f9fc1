// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! `tfdist-scheduler` process entry point.

use clap::Parser;
use std::sync::Arc;

use tfdist_runtime::discovery::MemoryStore;
use tfdist_runtime::{RuntimeConfig, exit_code, logging};
use tfdist_scheduler::SchedulerInstance;

#[derive(Parser, Debug)]
#[command(name = "tfdist-scheduler", about = "TimeFrame scheduler")]
struct Args {
    /// Partition to coordinate.
    #[arg(long, env = "TFDIST_PARTITION_ID")]
    partition: Option<String>,

    /// Process id unique within the partition.
    #[arg(long, env = "TFDIST_PROCESS_ID")]
    id: Option<String>,

    /// Comma-separated sender set of the partition.
    #[arg(long, env = "TFDIST_STF_SENDER_IDS", value_delimiter = ',')]
    senders: Vec<String>,
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
    if !args.senders.is_empty() {
        config.stf_sender_ids = args.senders;
    }
    if config.stf_sender_ids.is_empty() {
        tracing::error!("scheduler requires --senders or TFDIST_STF_SENDER_IDS");
        std::process::exit(exit_code::CONFIG);
    }

    let kv = Arc::new(MemoryStore::new());
    let handle = match SchedulerInstance::start(config, kv).await {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(error = %err, "scheduler startup failed");
            std::process::exit(exit_code::TRANSPORT_SETUP);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "signal wait failed");
    }
    handle.shutdown().await;
    std::process::exit(exit_code::CLEAN);
}
