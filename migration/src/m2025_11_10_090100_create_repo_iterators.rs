//! Migration to create the persistent repository iterator tables.
//!
//! `repo_iterator` stores the frozen repository list with its cursor and
//! progress counters; `repo_iterator_errors` stores one row per repository
//! that failed at least once.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RepoIterator::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepoIterator::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::LastUpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::RuntimeDurationMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::PercentComplete)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::TotalCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RepoIterator::SuccessCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(RepoIterator::Repos).json_binary().not_null())
                    .col(
                        ColumnDef::new(RepoIterator::RepoCursor)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RepoIteratorErrors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RepoIteratorErrors::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(RepoIteratorErrors::RepoIteratorId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoIteratorErrors::RepoId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoIteratorErrors::ErrorMessages)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoIteratorErrors::FailureCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(RepoIteratorErrors::Terminal)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repo_iterator_errors_iterator_id")
                            .from(RepoIteratorErrors::Table, RepoIteratorErrors::RepoIteratorId)
                            .to(RepoIterator::Table, RepoIterator::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repo_iterator_errors_iterator_repo")
                    .table(RepoIteratorErrors::Table)
                    .col(RepoIteratorErrors::RepoIteratorId)
                    .col(RepoIteratorErrors::RepoId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repo_iterator_errors_iterator_repo")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RepoIteratorErrors::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(RepoIterator::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepoIterator {
    Table,
    Id,
    CreatedAt,
    StartedAt,
    CompletedAt,
    LastUpdatedAt,
    RuntimeDurationMs,
    PercentComplete,
    TotalCount,
    SuccessCount,
    Repos,
    RepoCursor,
}

#[derive(DeriveIden)]
enum RepoIteratorErrors {
    Table,
    Id,
    RepoIteratorId,
    RepoId,
    ErrorMessages,
    FailureCount,
    Terminal,
}
