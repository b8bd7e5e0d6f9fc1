// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TimeFrame scheduler.
//!
//! Singleton per partition. Tracks which senders hold data for every
//! TimeFrame id, waits for completeness (or a deadline), picks one builder
//! by free buffer share, orchestrates the fetch and finalizes or drops the
//! TimeFrame. Per sender, fetch requests are serialized in ascending
//! `tf_id` order.

pub mod builder_pool;
pub mod conn;
pub mod instance;
pub mod tf_state;

pub use builder_pool::BuilderPool;
pub use conn::ConnManager;
pub use instance::{SchedulerHandle, SchedulerInstance};
pub use tf_state::TfStateMap;
