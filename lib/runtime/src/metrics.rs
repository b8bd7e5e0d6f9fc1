// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-local metrics.
//!
//! A single shared registry; components register their counters and gauges
//! under the `tfdist_` prefix. Exposition (scrape/push endpoints) is outside
//! the core and left to deployments.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::Result;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// The process-wide registry.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn int_counter(name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(format!("tfdist_{name}"), help))?;
    REGISTRY.register(Box::new(counter.clone()))?;
    Ok(counter)
}

pub fn int_counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(format!("tfdist_{name}"), help), labels)?;
    REGISTRY.register(Box::new(counter.clone()))?;
    Ok(counter)
}

pub fn int_gauge(name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(format!("tfdist_{name}"), help))?;
    REGISTRY.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Counters shared by the pipeline components, labelled by process id so a
/// test process hosting several components stays well-defined.
pub struct PipelineMetrics {
    pub tfs_built: IntCounterVec,
    pub tfs_dropped: IntCounterVec,
    pub bytes_fetched: IntCounterVec,
}

static PIPELINE: Lazy<PipelineMetrics> = Lazy::new(|| PipelineMetrics {
    tfs_built: int_counter_vec("tfs_built_total", "TimeFrames built", &["process"])
        .expect("pipeline metrics registration"),
    tfs_dropped: int_counter_vec(
        "tfs_dropped_total",
        "TimeFrames dropped",
        &["process", "reason"],
    )
    .expect("pipeline metrics registration"),
    bytes_fetched: int_counter_vec("bytes_fetched_total", "payload bytes fetched", &["process"])
        .expect("pipeline metrics registration"),
});

pub fn pipeline() -> &'static PipelineMetrics {
    &PIPELINE
}
