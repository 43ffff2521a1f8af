//! Job handlers of the two backfill queues.
//!
//! [`NewBackfillHandler`] sizes a New backfill and hands it to the in-progress
//! queue. [`InProgressHandler`] executes a Processing backfill page by page
//! under a time budget and an error breaker.

pub mod in_progress;
pub mod new_backfill;

pub use in_progress::InProgressHandler;
pub use new_backfill::NewBackfillHandler;
