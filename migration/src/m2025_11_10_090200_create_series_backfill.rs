//! Migration to create the backfill records and their background job queue.
//!
//! One `insight_series_backfill` row tracks a single attempt to populate the
//! history of a series. `insights_background_jobs` holds the queue entries
//! that point at a backfill; which logical queue a job belongs to is decided by
//! the state of the backfill it references.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InsightSeriesBackfill::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InsightSeriesBackfill::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesBackfill::SeriesId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesBackfill::RepoIteratorId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesBackfill::EstimatedCost)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesBackfill::State)
                            .text()
                            .not_null()
                            .default("new"),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_series_backfill_series_id")
                            .from(InsightSeriesBackfill::Table, InsightSeriesBackfill::SeriesId)
                            .to(InsightSeries::Table, InsightSeries::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_series_backfill_repo_iterator_id")
                            .from(
                                InsightSeriesBackfill::Table,
                                InsightSeriesBackfill::RepoIteratorId,
                            )
                            .to(RepoIterator::Table, RepoIterator::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_series_backfill_series_id")
                    .table(InsightSeriesBackfill::Table)
                    .col(InsightSeriesBackfill::SeriesId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InsightsBackgroundJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::BackfillId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::State)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::FailureMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::QueuedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::ProcessAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::LastHeartbeatAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::NumResets)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::NumFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InsightsBackgroundJobs::WorkerHostname)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_background_jobs_backfill_id")
                            .from(
                                InsightsBackgroundJobs::Table,
                                InsightsBackgroundJobs::BackfillId,
                            )
                            .to(InsightSeriesBackfill::Table, InsightSeriesBackfill::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for dequeuing ready jobs
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_background_jobs_state_process_after ON insights_background_jobs (state, process_after)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_background_jobs_backfill_id")
                    .table(InsightsBackgroundJobs::Table)
                    .col(InsightsBackgroundJobs::BackfillId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_background_jobs_state_process_after")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_background_jobs_backfill_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(InsightsBackgroundJobs::Table).to_owned())
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_series_backfill_series_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(InsightSeriesBackfill::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InsightSeriesBackfill {
    Table,
    Id,
    SeriesId,
    RepoIteratorId,
    EstimatedCost,
    State,
}

#[derive(DeriveIden)]
enum InsightsBackgroundJobs {
    Table,
    Id,
    BackfillId,
    State,
    FailureMessage,
    QueuedAt,
    StartedAt,
    FinishedAt,
    ProcessAfter,
    LastHeartbeatAt,
    NumResets,
    NumFailures,
    WorkerHostname,
}

#[derive(DeriveIden)]
enum InsightSeries {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum RepoIterator {
    Table,
    Id,
}
