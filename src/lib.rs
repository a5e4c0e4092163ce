//! # Stageweave
//!
//! Fault-tolerance substrate for pipelines of stream-processing stages
//! connected by a message broker.
//!
//! Every stage consumes tenant-tagged messages, folds them into per-tenant
//! state, and emits derived messages downstream. The broker delivers at least
//! once and stages crash and restart; this crate turns that into
//! effectively-exactly-once processing:
//!
//! - **Protocol**: the tagged wire message and its length-prefixed framing
//!   ([`protocol`], [`transport`]).
//! - **Dedup ledger**: per-tenant, per-origin sequence numbers deciding what
//!   was already applied and numbering what is emitted ([`ledger`]).
//! - **Checkpoints**: ledger and operator state persisted atomically after
//!   every applied message ([`checkpoint`], [`context`]).
//! - **Operator runtime**: decode, deduplicate, reduce, publish, persist,
//!   acknowledge ([`runtime`], [`broker`], [`reducers`]).
//! - **Liveness**: health responder, peer pollers and revival
//!   ([`liveness`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stageweave::broker::InMemoryBroker;
//! use stageweave::config::StageConfig;
//! use stageweave::reducers::GroupingAggregator;
//! use stageweave::stage::Stage;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> stageweave::error::StageResult<()> {
//! let config = StageConfig::new("counter_of_reviews")
//!   .with_input_queue("reviews")
//!   .with_outputs("counter_exchange", vec!["sorter_input".to_string()]);
//! let reducer = GroupingAggregator::new(config.grouping_config());
//! Stage::new(config, reducer, InMemoryBroker::new())
//!   .run(CancellationToken::new())
//!   .await
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Broker boundary and in-memory broker.
pub mod broker;
/// Checkpoint storage and document layout.
pub mod checkpoint;
/// Stage configuration from environment or file.
pub mod config;
/// Ledger plus operator state of one stage.
pub mod context;
/// Crate-level error type.
pub mod error;
/// Per-tenant sequence-number dedup ledger.
pub mod ledger;
/// Health responder, peer pollers and revival.
pub mod liveness;
/// Logging setup.
pub mod observability;
/// Stable partition selection.
pub mod partitioning;
/// Wire message and framing.
pub mod protocol;
/// Reference reducers and payload helpers.
pub mod reducers;
/// Per-message operator runtime.
pub mod runtime;
/// Stage process lifecycle and shutdown.
pub mod stage;
/// Framed TCP peer connections.
pub mod transport;

#[cfg(test)]
mod protocol_test;
