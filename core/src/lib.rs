#![deny(missing_docs)]
//! beacon_core: shared building blocks (task model, ids, snapshot store, config, logging).

/// Configuration constants and config path resolution.
pub mod cfg;
/// Task id generation.
pub mod id;
/// Tracing/log initialization helpers.
pub mod logx;
/// Crash-consistent JSON snapshot of all tasks.
pub mod store;
/// Task model and add-request validation.
pub mod task;
