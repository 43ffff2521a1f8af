//! Recording times of an insight series: the sample timestamps a backfill fills in.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "insight_series_recording_times")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub insight_series_id: i32,
    pub recording_time: DateTimeWithTimeZone,
    pub snapshot: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
