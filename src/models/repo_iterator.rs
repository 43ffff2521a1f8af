//! RepoIterator entity model
//!
//! Durable state of a repository iterator. The repository list is frozen at
//! creation and addressed by `repo_cursor`.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repo_iterator")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub created_at: DateTimeWithTimeZone,

    /// Stamped on the first committed page
    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub last_updated_at: DateTimeWithTimeZone,

    /// Accumulated processing time in milliseconds
    pub runtime_duration_ms: i64,

    pub percent_complete: f64,

    pub total_count: i32,

    pub success_count: i32,

    /// Ordered repository ids (JSON array of integers)
    #[sea_orm(column_type = "JsonBinary")]
    pub repos: JsonValue,

    /// Position of the next unvisited repository in `repos`
    pub repo_cursor: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::repo_iterator_error::Entity")]
    Errors,
}

impl Related<super::repo_iterator_error::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Errors.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
