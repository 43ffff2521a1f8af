//! IncompletePoint entity model
//!
//! Markers recording that a sample timestamp could not be computed, either for
//! one repository or (with no repository) for the whole series.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};

/// Why a data point is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum IncompleteReason {
    /// The repository search timed out on every attempt
    #[sea_orm(string_value = "timeout")]
    Timeout,
    /// The repository failed for any other reason
    #[sea_orm(string_value = "generic")]
    Generic,
    /// The backfill was abandoned after too many repository failures
    #[sea_orm(string_value = "exceeds-error-limit")]
    ExceedsErrorLimit,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "insight_series_incomplete_points")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub series_id: i32,
    pub repo_id: Option<i32>,
    pub reason: IncompleteReason,
    pub time: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
