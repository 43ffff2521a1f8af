//! SeriesBackfill entity model
//!
//! One attempt to populate the history of an insight series. The state column
//! also decides which logical job queue the backfill's jobs belong to.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a backfill. Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum BackfillState {
    #[sea_orm(string_value = "new")]
    New,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl BackfillState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillState::New => "new",
            BackfillState::Processing => "processing",
            BackfillState::Completed => "completed",
            BackfillState::Failed => "failed",
        }
    }
}

impl fmt::Display for BackfillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "insight_series_backfill")]
pub struct Model {
    /// Identity; also the insertion order used to break cost ties
    #[sea_orm(primary_key)]
    pub id: i32,

    pub series_id: i32,

    /// Unset while New, fixed once scope is assigned
    pub repo_iterator_id: Option<i32>,

    /// Dequeue ordering key of Processing backfills, cheapest first
    pub estimated_cost: f64,

    pub state: BackfillState,
}

impl Model {
    /// Whether the backfill has reached Completed or Failed.
    pub fn is_terminal_state(&self) -> bool {
        matches!(self.state, BackfillState::Completed | BackfillState::Failed)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::background_job::Entity")]
    Jobs,
}

impl Related<super::background_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Jobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
