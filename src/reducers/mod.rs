//! # Reference Reducers
//!
//! Operator logic shipped with the runtime:
//!
//! - [`GroupingAggregator`]: groups rows by key and emits per-key summaries
//!   at end of stream.
//! - [`TopKRanker`]: keeps the K rows with the highest average score.
//! - [`PartitioningExpander`]: splits list-valued rows and routes each item
//!   to a partition by stable hash, with an END_OF_STREAM barrier over its
//!   producers.
//!
//! [`literal`] and [`rows`] hold the payload parsing they share.

mod expander;
mod grouping;
pub mod literal;
pub mod rows;
mod top_k;

pub use expander::{ExpanderState, PartitioningExpander};
pub use grouping::{Group, GroupingAggregator, GroupingConfig, GroupingState};
pub use top_k::{TopKRanker, TopKState};
