//! # Error Handling
//!
//! Error types shared by the backfill store, the repository iterator, the job
//! queue and both handlers.

use sea_orm::DbErr;
use thiserror::Error;
use tracing::error;

use crate::models::BackfillState;

/// Errors surfaced by backfill state transitions and their execution engine.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// A database statement or transaction failed.
    #[error("database error while trying to {context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },

    /// Enumerating the repositories of a series failed.
    #[error("failed to resolve repository scope: {0}")]
    ScopeResolution(#[source] anyhow::Error),

    /// The cost analyzer could not score the series query.
    #[error("failed to estimate backfill cost: {0}")]
    CostEstimation(#[source] anyhow::Error),

    /// The backfill is not in the state the operation requires.
    #[error("backfill {backfill_id} is {actual}, expected {expected}")]
    InvalidState {
        backfill_id: i32,
        expected: BackfillState,
        actual: BackfillState,
    },

    /// The operation requires a persisted backfill.
    #[error("backfill has no identity")]
    MissingIdentity,

    /// Scope can only be assigned once per backfill.
    #[error("backfill {0} already has a repository iterator")]
    ScopeAlreadyAssigned(i32),

    /// A backfill past the New state has no iterator attached.
    #[error("backfill {0} has no repository iterator")]
    MissingIterator(i32),

    /// A referenced record does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i32 },

    /// A page or retry item was finished against an iterator that moved on.
    #[error("stale work item for iterator {iterator_id}: cursor is {cursor}, item expected {expected}")]
    StaleIteration {
        iterator_id: i32,
        cursor: i32,
        expected: i32,
    },

    /// Stored iterator state could not be decoded.
    #[error("corrupt iterator state for iterator {iterator_id}: {source}")]
    CorruptIterator {
        iterator_id: i32,
        #[source]
        source: serde_json::Error,
    },
}

impl BackfillError {
    /// Whether the error came from the database layer.
    pub fn is_database(&self) -> bool {
        matches!(self, BackfillError::Database { .. })
    }
}

/// Log a database failure and wrap it with the operation that was attempted.
pub(crate) fn map_db_err(context: &'static str, err: DbErr) -> BackfillError {
    error!(error = %err, "database error: {context}");
    BackfillError::Database {
        context,
        source: err,
    }
}
