//! # Stores
//!
//! Transactional persistence for backfill records and the series-level
//! bookkeeping written at backfill state transitions.

pub mod backfill;
pub mod series;

pub use backfill::{BackfillStore, RepoErrorSummary};
pub use series::{IncompleteDatapoint, NewSeries, SeriesStore};
