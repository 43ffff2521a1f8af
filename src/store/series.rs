//! # Series Store
//!
//! Series-level bookkeeping: series lookup, backfill queued/completed
//! timestamps, recording times and incompleteness markers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};
use serde_json::json;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{BackfillError, map_db_err};
use crate::models::{
    IncompletePoint, IncompleteReason, InsightSeries, IntervalUnit, RecordingTime, Series,
    incomplete_point, insight_series, recording_time,
};

/// Input for creating a series definition.
#[derive(Debug, Clone)]
pub struct NewSeries {
    pub series_id: String,
    pub query: String,
    pub interval_unit: IntervalUnit,
    pub interval_value: i32,
    /// Explicit repository names; `None` covers every repository
    pub repositories: Option<Vec<String>>,
}

/// A marker noting that one sample time could not be computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteDatapoint {
    pub series_id: i32,
    /// `None` marks the whole series at that time
    pub repo_id: Option<i32>,
    pub reason: IncompleteReason,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SeriesStore {
    clock: Arc<dyn Clock>,
}

impl SeriesStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub async fn create_series<C: ConnectionTrait>(
        &self,
        conn: &C,
        input: NewSeries,
    ) -> Result<Series, BackfillError> {
        insight_series::ActiveModel {
            series_id: Set(input.series_id),
            query: Set(input.query),
            created_at: Set(self.clock.now_db()),
            sample_interval_unit: Set(input.interval_unit),
            sample_interval_value: Set(input.interval_value),
            repositories: Set(input.repositories.map(|names| json!(names))),
            backfill_queued_at: Set(None),
            backfill_completed_at: Set(None),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(|err| map_db_err("create insight series", err))
    }

    pub async fn get_data_series_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: i32,
    ) -> Result<Series, BackfillError> {
        InsightSeries::find_by_id(id)
            .one(conn)
            .await
            .map_err(|err| map_db_err("load insight series", err))?
            .ok_or(BackfillError::NotFound {
                entity: "insight series",
                id,
            })
    }

    /// Record that the backfill of a series was sized and queued for execution.
    pub async fn stamp_backfill_queued<C: ConnectionTrait>(
        &self,
        conn: &C,
        series_id: i32,
    ) -> Result<(), BackfillError> {
        InsightSeries::update_many()
            .col_expr(
                insight_series::Column::BackfillQueuedAt,
                Expr::value(self.clock.now_db()),
            )
            .filter(insight_series::Column::Id.eq(series_id))
            .exec(conn)
            .await
            .map_err(|err| map_db_err("stamp series backfill queued", err))?;
        Ok(())
    }

    pub async fn set_series_backfill_complete<C: ConnectionTrait>(
        &self,
        conn: &C,
        series_id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), BackfillError> {
        InsightSeries::update_many()
            .col_expr(
                insight_series::Column::BackfillCompletedAt,
                Expr::value(at.fixed_offset()),
            )
            .filter(insight_series::Column::Id.eq(series_id))
            .exec(conn)
            .await
            .map_err(|err| map_db_err("set series backfill complete", err))?;
        Ok(())
    }

    /// Persist the sample times of a series. Times already recorded are kept.
    pub async fn set_insight_series_recording_times<C: ConnectionTrait>(
        &self,
        conn: &C,
        series_id: i32,
        times: &[DateTime<Utc>],
    ) -> Result<(), BackfillError> {
        if times.is_empty() {
            return Ok(());
        }

        let rows = times.iter().map(|time| recording_time::ActiveModel {
            insight_series_id: Set(series_id),
            recording_time: Set(time.fixed_offset()),
            snapshot: Set(false),
            ..Default::default()
        });

        let result = RecordingTime::insert_many(rows)
            .on_conflict(
                OnConflict::columns([
                    recording_time::Column::InsightSeriesId,
                    recording_time::Column::RecordingTime,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(conn)
            .await;

        match result {
            Ok(inserted) => {
                debug!(series_id, inserted, "Recorded series sample times");
                Ok(())
            }
            Err(DbErr::RecordNotInserted) => Ok(()),
            Err(err) => Err(map_db_err("insert series recording times", err)),
        }
    }

    pub async fn load_recording_times<C: ConnectionTrait>(
        &self,
        conn: &C,
        series_id: i32,
    ) -> Result<Vec<DateTime<Utc>>, BackfillError> {
        let rows = RecordingTime::find()
            .filter(recording_time::Column::InsightSeriesId.eq(series_id))
            .order_by_asc(recording_time::Column::RecordingTime)
            .all(conn)
            .await
            .map_err(|err| map_db_err("load series recording times", err))?;
        Ok(rows
            .into_iter()
            .map(|row| row.recording_time.with_timezone(&Utc))
            .collect())
    }

    /// Write an incompleteness marker unless an identical one already exists.
    pub async fn add_incomplete_datapoint<C: ConnectionTrait>(
        &self,
        conn: &C,
        point: IncompleteDatapoint,
    ) -> Result<(), BackfillError> {
        let time = point.time.fixed_offset();
        let repo_filter = match point.repo_id {
            Some(repo_id) => incomplete_point::Column::RepoId.eq(repo_id),
            None => incomplete_point::Column::RepoId.is_null(),
        };

        let existing = IncompletePoint::find()
            .filter(incomplete_point::Column::SeriesId.eq(point.series_id))
            .filter(repo_filter)
            .filter(incomplete_point::Column::Reason.eq(point.reason))
            .filter(incomplete_point::Column::Time.eq(time))
            .one(conn)
            .await
            .map_err(|err| map_db_err("look up incomplete datapoint", err))?;
        if existing.is_some() {
            return Ok(());
        }

        incomplete_point::ActiveModel {
            series_id: Set(point.series_id),
            repo_id: Set(point.repo_id),
            reason: Set(point.reason),
            time: Set(time),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(|err| map_db_err("insert incomplete datapoint", err))?;
        Ok(())
    }

    /// Drop the series-wide error-limit markers left by a failed attempt.
    pub async fn clear_error_limit_markers<C: ConnectionTrait>(
        &self,
        conn: &C,
        series_id: i32,
    ) -> Result<u64, BackfillError> {
        let result = IncompletePoint::delete_many()
            .filter(incomplete_point::Column::SeriesId.eq(series_id))
            .filter(incomplete_point::Column::RepoId.is_null())
            .filter(incomplete_point::Column::Reason.eq(IncompleteReason::ExceedsErrorLimit))
            .exec(conn)
            .await
            .map_err(|err| map_db_err("clear error limit markers", err))?;
        debug!(series_id, cleared = result.rows_affected, "Cleared error limit markers");
        Ok(result.rows_affected)
    }

    pub async fn load_incomplete_datapoints<C: ConnectionTrait>(
        &self,
        conn: &C,
        series_id: i32,
    ) -> Result<Vec<IncompleteDatapoint>, BackfillError> {
        let rows = IncompletePoint::find()
            .filter(incomplete_point::Column::SeriesId.eq(series_id))
            .order_by_asc(incomplete_point::Column::Time)
            .order_by_asc(incomplete_point::Column::Id)
            .all(conn)
            .await
            .map_err(|err| map_db_err("load incomplete datapoints", err))?;
        Ok(rows
            .into_iter()
            .map(|row| IncompleteDatapoint {
                series_id: row.series_id,
                repo_id: row.repo_id,
                reason: row.reason,
                time: row.time.with_timezone(&Utc),
            })
            .collect())
    }
}
