//! Migration to create the insight series bookkeeping tables.
//!
//! `insight_series` is the series definition the backfiller reads, while
//! `insight_series_recording_times` and `insight_series_incomplete_points` hold
//! the sample timestamps and the incompleteness markers written while a series
//! is backfilled.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InsightSeries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InsightSeries::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InsightSeries::SeriesId)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(InsightSeries::Query).text().not_null())
                    .col(
                        ColumnDef::new(InsightSeries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(InsightSeries::SampleIntervalUnit)
                            .text()
                            .not_null()
                            .default("MONTH"),
                    )
                    .col(
                        ColumnDef::new(InsightSeries::SampleIntervalValue)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(InsightSeries::Repositories).json_binary().null())
                    .col(
                        ColumnDef::new(InsightSeries::BackfillQueuedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeries::BackfillCompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InsightSeriesRecordingTimes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InsightSeriesRecordingTimes::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesRecordingTimes::InsightSeriesId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesRecordingTimes::RecordingTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesRecordingTimes::Snapshot)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_recording_times_series_id")
                            .from(
                                InsightSeriesRecordingTimes::Table,
                                InsightSeriesRecordingTimes::InsightSeriesId,
                            )
                            .to(InsightSeries::Table, InsightSeries::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_recording_times_series_time")
                    .table(InsightSeriesRecordingTimes::Table)
                    .col(InsightSeriesRecordingTimes::InsightSeriesId)
                    .col(InsightSeriesRecordingTimes::RecordingTime)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InsightSeriesIncompletePoints::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InsightSeriesIncompletePoints::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesIncompletePoints::SeriesId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesIncompletePoints::RepoId)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesIncompletePoints::Reason)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InsightSeriesIncompletePoints::Time)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_incomplete_points_series_id")
                            .from(
                                InsightSeriesIncompletePoints::Table,
                                InsightSeriesIncompletePoints::SeriesId,
                            )
                            .to(InsightSeries::Table, InsightSeries::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_incomplete_points_series_reason_time")
                    .table(InsightSeriesIncompletePoints::Table)
                    .col(InsightSeriesIncompletePoints::SeriesId)
                    .col(InsightSeriesIncompletePoints::Reason)
                    .col(InsightSeriesIncompletePoints::Time)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_incomplete_points_series_reason_time")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(InsightSeriesIncompletePoints::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_recording_times_series_time")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(
                Table::drop()
                    .table(InsightSeriesRecordingTimes::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(InsightSeries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InsightSeries {
    Table,
    Id,
    SeriesId,
    Query,
    CreatedAt,
    SampleIntervalUnit,
    SampleIntervalValue,
    Repositories,
    BackfillQueuedAt,
    BackfillCompletedAt,
}

#[derive(DeriveIden)]
enum InsightSeriesRecordingTimes {
    Table,
    Id,
    InsightSeriesId,
    RecordingTime,
    Snapshot,
}

#[derive(DeriveIden)]
enum InsightSeriesIncompletePoints {
    Table,
    Id,
    SeriesId,
    RepoId,
    Reason,
    Time,
}
