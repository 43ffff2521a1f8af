//! BackgroundJob entity model
//!
//! Rows of the shared job table. A job belongs to the new-backfill queue or the
//! in-progress queue depending on the state of the backfill it points at.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};

/// Queue-level state of a job, independent of the backfill state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum JobState {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    /// Failed an attempt and waits for a retry
    #[sea_orm(string_value = "errored")]
    Errored,
    /// Exhausted its retries or resets
    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "insights_background_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub backfill_id: i32,

    pub state: JobState,

    pub failure_message: Option<String>,

    pub queued_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Earliest time the job may be dequeued again
    pub process_after: Option<DateTimeWithTimeZone>,

    pub last_heartbeat_at: Option<DateTimeWithTimeZone>,

    pub num_resets: i32,

    pub num_failures: i32,

    pub worker_hostname: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::series_backfill::Entity",
        from = "Column::BackfillId",
        to = "super::series_backfill::Column::Id"
    )]
    Backfill,
}

impl Related<super::series_backfill::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Backfill.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
