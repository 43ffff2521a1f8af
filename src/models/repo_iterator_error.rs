//! Per-repository failure record of a repository iterator.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repo_iterator_errors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub repo_iterator_id: i32,

    pub repo_id: i32,

    /// Every failure message recorded for the repository, oldest first
    #[sea_orm(column_type = "JsonBinary")]
    pub error_messages: JsonValue,

    pub failure_count: i32,

    /// Set once the failure cap is reached; terminal rows are never retried
    pub terminal: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::repo_iterator::Entity",
        from = "Column::RepoIteratorId",
        to = "super::repo_iterator::Column::Id"
    )]
    Iterator,
}

impl Related<super::repo_iterator::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Iterator.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
