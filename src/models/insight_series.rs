//! InsightSeries entity model
//!
//! The series definition read by the backfiller: the search query, the
//! sampling cadence and the optional explicit repository list.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Unit of the sampling interval between two data points of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum IntervalUnit {
    #[sea_orm(string_value = "HOUR")]
    Hour,
    #[sea_orm(string_value = "DAY")]
    Day,
    #[sea_orm(string_value = "WEEK")]
    Week,
    #[sea_orm(string_value = "MONTH")]
    Month,
    #[sea_orm(string_value = "YEAR")]
    Year,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "insight_series")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Stable external identifier of the series
    #[sea_orm(unique)]
    pub series_id: String,

    /// Search query whose matches are sampled
    pub query: String,

    pub created_at: DateTimeWithTimeZone,

    pub sample_interval_unit: IntervalUnit,

    pub sample_interval_value: i32,

    /// Explicit repository names; `None` means every repository
    #[sea_orm(column_type = "JsonBinary")]
    pub repositories: Option<JsonValue>,

    /// Set once the backfill has been sized and queued for execution
    pub backfill_queued_at: Option<DateTimeWithTimeZone>,

    /// Set when the backfill finished successfully
    pub backfill_completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Explicit repository names of the series, empty when it covers all repositories.
    pub fn repository_names(&self) -> Vec<String> {
        self.repositories
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
