//! # Insights Backfiller
//!
//! Durable scheduling and execution of historical backfills for insight
//! series: the backfill state machine, a resumable repository iterator, the
//! two-queue job model and the handlers that drive them.

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod cost;
pub mod db;
pub mod error;
pub mod handlers;
pub mod iterator;
pub mod models;
pub mod queue;
pub mod sampling;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub use migration;
