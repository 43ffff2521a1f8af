//! # Backfill Job Queue
//!
//! One physical job table, `insights_background_jobs`, exposed as two logical
//! queues. A job belongs to the new-backfill queue while its backfill is New
//! and to the in-progress queue while it is Processing; membership is derived
//! from the joined backfill state and never stored twice.
//!
//! Dequeue takes an exclusive lease (`processing` plus a heartbeat). The
//! [`worker::StalledJobResetter`] reclaims leases whose heartbeat went stale.

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use metrics::counter;
use sea_orm::sea_query::{Expr, LockBehavior, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Select, Set,
    TransactionTrait,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{BackfillError, map_db_err};
use crate::models::{BackfillState, BackgroundJob, JobState, background_job, series_backfill};

pub use worker::{QueueWorker, StalledJobResetter};

/// A row of the shared job table.
pub type Job = background_job::Model;

/// The two logical queues over the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Jobs of backfills waiting to be sized (state New)
    NewBackfill,
    /// Jobs of backfills being executed (state Processing)
    InProgress,
}

impl QueueKind {
    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::NewBackfill => "new_backfill",
            QueueKind::InProgress => "in_progress",
        }
    }

    fn backfill_state(&self) -> BackfillState {
        match self {
            QueueKind::NewBackfill => BackfillState::New,
            QueueKind::InProgress => BackfillState::Processing,
        }
    }
}

/// What the worker should do with a job after its handler returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job is done
    Complete,
    /// Put the job back after a delay without counting a failure
    Requeue(Duration),
    /// The attempt made progress but left work behind. Retried after the
    /// retry backoff; this is not a failure of the job itself.
    Incomplete(String),
}

/// Processes one dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobOutcome, BackfillError>;
}

/// Stalled jobs handled by one resetter pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub reset: Vec<i32>,
    pub failed: Vec<i32>,
}

/// Insert a queued job for `backfill_id`.
pub(crate) async fn insert_job<C: ConnectionTrait>(
    conn: &C,
    backfill_id: i32,
    now: DateTime<FixedOffset>,
) -> Result<Job, BackfillError> {
    let job = background_job::ActiveModel {
        backfill_id: Set(backfill_id),
        state: Set(JobState::Queued),
        failure_message: Set(None),
        queued_at: Set(now),
        started_at: Set(None),
        finished_at: Set(None),
        process_after: Set(None),
        last_heartbeat_at: Set(None),
        num_resets: Set(0),
        num_failures: Set(0),
        worker_hostname: Set(String::new()),
        ..Default::default()
    }
    .insert(conn)
    .await
    .map_err(|err| map_db_err("enqueue backfill job", err))?;

    debug!(job_id = job.id, backfill_id, "Enqueued backfill job");
    Ok(job)
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
    worker_hostname: String,
}

impl JobQueue {
    pub fn new(db: Arc<DatabaseConnection>, clock: Arc<dyn Clock>) -> Self {
        let worker_hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            db,
            clock,
            worker_hostname,
        }
    }

    pub fn with_worker_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.worker_hostname = hostname.into();
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Add a job for `backfill_id`; the backfill state decides its queue.
    pub async fn enqueue<C: ConnectionTrait>(
        &self,
        conn: &C,
        backfill_id: i32,
    ) -> Result<Job, BackfillError> {
        insert_job(conn, backfill_id, self.clock.now_db()).await
    }

    /// Lease the next ready job of `kind`, if any.
    pub async fn dequeue(&self, kind: QueueKind) -> Result<Option<Job>, BackfillError> {
        let now = self.clock.now_db();
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("begin dequeue", err))?;

        let query = ready_jobs(kind, now);
        let query = match kind {
            QueueKind::NewBackfill => query.order_by_asc(background_job::Column::Id),
            QueueKind::InProgress => query
                .order_by_asc(series_backfill::Column::EstimatedCost)
                .order_by_asc(series_backfill::Column::Id)
                .order_by_asc(background_job::Column::Id),
        };

        let Some(candidate) = query
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .one(&txn)
            .await
            .map_err(|err| map_db_err("select next job", err))?
        else {
            txn.rollback()
                .await
                .map_err(|err| map_db_err("rollback dequeue", err))?;
            return Ok(None);
        };

        let claimed = BackgroundJob::update_many()
            .col_expr(
                background_job::Column::State,
                Expr::value(JobState::Processing),
            )
            .col_expr(background_job::Column::StartedAt, Expr::value(now))
            .col_expr(background_job::Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(
                background_job::Column::WorkerHostname,
                Expr::value(self.worker_hostname.clone()),
            )
            .filter(background_job::Column::Id.eq(candidate.id))
            .filter(background_job::Column::State.is_in([JobState::Queued, JobState::Errored]))
            .exec(&txn)
            .await
            .map_err(|err| map_db_err("claim job", err))?;

        if claimed.rows_affected == 0 {
            txn.rollback()
                .await
                .map_err(|err| map_db_err("rollback dequeue", err))?;
            return Ok(None);
        }

        let job = BackgroundJob::find_by_id(candidate.id)
            .one(&txn)
            .await
            .map_err(|err| map_db_err("reload claimed job", err))?
            .ok_or(BackfillError::NotFound {
                entity: "background job",
                id: candidate.id,
            })?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("commit dequeue", err))?;

        counter!("insights_backfill_jobs_dequeued_total", "queue" => kind.name()).increment(1);
        debug!(job_id = job.id, backfill_id = job.backfill_id, queue = kind.name(), "Dequeued job");
        Ok(Some(job))
    }

    /// Refresh the lease of running jobs.
    pub async fn heartbeat(&self, job_ids: &[i32]) -> Result<(), BackfillError> {
        if job_ids.is_empty() {
            return Ok(());
        }
        BackgroundJob::update_many()
            .col_expr(
                background_job::Column::LastHeartbeatAt,
                Expr::value(self.clock.now_db()),
            )
            .filter(background_job::Column::Id.is_in(job_ids.iter().copied()))
            .filter(background_job::Column::State.eq(JobState::Processing))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("heartbeat jobs", err))?;
        Ok(())
    }

    /// Mark a leased job completed. Returns whether this call completed it.
    pub async fn mark_complete<C: ConnectionTrait>(
        &self,
        conn: &C,
        job_id: i32,
    ) -> Result<bool, BackfillError> {
        let result = BackgroundJob::update_many()
            .col_expr(
                background_job::Column::State,
                Expr::value(JobState::Completed),
            )
            .col_expr(
                background_job::Column::FinishedAt,
                Expr::value(self.clock.now_db()),
            )
            .filter(background_job::Column::Id.eq(job_id))
            .filter(background_job::Column::State.eq(JobState::Processing))
            .exec(conn)
            .await
            .map_err(|err| map_db_err("complete job", err))?;
        Ok(result.rows_affected > 0)
    }

    /// Release a leased job so it becomes ready again after `delay`.
    pub async fn requeue(&self, job_id: i32, delay: Duration) -> Result<(), BackfillError> {
        let process_after = after(self.clock.now_db(), delay);
        BackgroundJob::update_many()
            .col_expr(background_job::Column::State, Expr::value(JobState::Queued))
            .col_expr(
                background_job::Column::ProcessAfter,
                Expr::value(process_after),
            )
            .filter(background_job::Column::Id.eq(job_id))
            .filter(background_job::Column::State.eq(JobState::Processing))
            .exec(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("requeue job", err))?;
        debug!(job_id, delay_secs = delay.as_secs(), "Requeued job");
        Ok(())
    }

    /// Record a failed attempt. The job is retried after `backoff` until it has
    /// failed more than `max_retries` times, then it is failed for good.
    pub async fn mark_errored(
        &self,
        job_id: i32,
        message: &str,
        max_retries: i32,
        backoff: Duration,
    ) -> Result<JobState, BackfillError> {
        let now = self.clock.now_db();
        let job = BackgroundJob::find_by_id(job_id)
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("load errored job", err))?
            .ok_or(BackfillError::NotFound {
                entity: "background job",
                id: job_id,
            })?;

        let num_failures = job.num_failures + 1;
        let exhausted = num_failures > max_retries;
        let mut active: background_job::ActiveModel = job.into();
        active.num_failures = Set(num_failures);
        active.failure_message = Set(Some(message.to_string()));
        if exhausted {
            active.state = Set(JobState::Failed);
            active.finished_at = Set(Some(now));
        } else {
            active.state = Set(JobState::Errored);
            active.process_after = Set(Some(after(now, backoff)));
        }
        let updated = active
            .update(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("mark job errored", err))?;

        if exhausted {
            warn!(job_id, num_failures, error = message, "Job exhausted its retries");
            counter!("insights_backfill_jobs_failed_total").increment(1);
        } else {
            debug!(job_id, num_failures, error = message, "Job attempt failed");
        }
        Ok(updated.state)
    }

    /// Reclaim leases whose heartbeat is older than `threshold`. Jobs reset
    /// `max_resets` times already are failed instead.
    pub async fn reset_stalled(
        &self,
        threshold: Duration,
        max_resets: i32,
    ) -> Result<ResetOutcome, BackfillError> {
        let now = self.clock.now_db();
        let cutoff = before(now, threshold);
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("begin stalled job reset", err))?;

        let stalled = BackgroundJob::find()
            .filter(background_job::Column::State.eq(JobState::Processing))
            .filter(
                Condition::any()
                    .add(background_job::Column::LastHeartbeatAt.is_null())
                    .add(background_job::Column::LastHeartbeatAt.lt(cutoff)),
            )
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .all(&txn)
            .await
            .map_err(|err| map_db_err("select stalled jobs", err))?;

        let (exhausted, resettable): (Vec<Job>, Vec<Job>) = stalled
            .into_iter()
            .partition(|job| job.num_resets >= max_resets);
        let outcome = ResetOutcome {
            reset: resettable.iter().map(|job| job.id).collect(),
            failed: exhausted.iter().map(|job| job.id).collect(),
        };

        if !outcome.reset.is_empty() {
            BackgroundJob::update_many()
                .col_expr(background_job::Column::State, Expr::value(JobState::Queued))
                .col_expr(
                    background_job::Column::NumResets,
                    Expr::col(background_job::Column::NumResets).add(1),
                )
                .col_expr(
                    background_job::Column::StartedAt,
                    Expr::value(Option::<DateTime<FixedOffset>>::None),
                )
                .filter(background_job::Column::Id.is_in(outcome.reset.clone()))
                .exec(&txn)
                .await
                .map_err(|err| map_db_err("reset stalled jobs", err))?;
        }

        if !outcome.failed.is_empty() {
            BackgroundJob::update_many()
                .col_expr(background_job::Column::State, Expr::value(JobState::Failed))
                .col_expr(background_job::Column::FinishedAt, Expr::value(now))
                .col_expr(
                    background_job::Column::FailureMessage,
                    Expr::value("job stalled too many times"),
                )
                .filter(background_job::Column::Id.is_in(outcome.failed.clone()))
                .exec(&txn)
                .await
                .map_err(|err| map_db_err("fail stalled jobs", err))?;
        }

        txn.commit()
            .await
            .map_err(|err| map_db_err("commit stalled job reset", err))?;

        if !outcome.reset.is_empty() || !outcome.failed.is_empty() {
            info!(
                reset = outcome.reset.len(),
                failed = outcome.failed.len(),
                "Reclaimed stalled jobs"
            );
            counter!("insights_backfill_jobs_reset_total").increment(outcome.reset.len() as u64);
        }
        Ok(outcome)
    }

    /// Number of jobs of `kind` waiting to be dequeued, ready or not.
    pub async fn queue_depth(&self, kind: QueueKind) -> Result<u64, BackfillError> {
        BackgroundJob::find()
            .join(
                sea_orm::JoinType::InnerJoin,
                background_job::Relation::Backfill.def(),
            )
            .filter(background_job::Column::State.is_in([JobState::Queued, JobState::Errored]))
            .filter(series_backfill::Column::State.eq(kind.backfill_state()))
            .count(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("count queued jobs", err))
    }

    pub async fn load_job(&self, job_id: i32) -> Result<Job, BackfillError> {
        BackgroundJob::find_by_id(job_id)
            .one(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("load job", err))?
            .ok_or(BackfillError::NotFound {
                entity: "background job",
                id: job_id,
            })
    }

    /// Every job of a backfill, oldest first.
    pub async fn jobs_for_backfill(&self, backfill_id: i32) -> Result<Vec<Job>, BackfillError> {
        BackgroundJob::find()
            .filter(background_job::Column::BackfillId.eq(backfill_id))
            .order_by_asc(background_job::Column::Id)
            .all(self.db.as_ref())
            .await
            .map_err(|err| map_db_err("load backfill jobs", err))
    }
}

/// Jobs of `kind` that may be leased at `now`.
fn ready_jobs(kind: QueueKind, now: DateTime<FixedOffset>) -> Select<BackgroundJob> {
    BackgroundJob::find()
        .join(
            sea_orm::JoinType::InnerJoin,
            background_job::Relation::Backfill.def(),
        )
        .filter(background_job::Column::State.is_in([JobState::Queued, JobState::Errored]))
        .filter(
            Condition::any()
                .add(background_job::Column::ProcessAfter.is_null())
                .add(background_job::Column::ProcessAfter.lte(now)),
        )
        .filter(series_backfill::Column::State.eq(kind.backfill_state()))
}

/// `now + delay`, saturating at the latest representable instant.
fn after(now: DateTime<FixedOffset>, delay: Duration) -> DateTime<FixedOffset> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or_else(|| DateTime::<Utc>::MAX_UTC.fixed_offset())
}

/// `now - window`, saturating at the earliest representable instant.
fn before(now: DateTime<FixedOffset>, window: Duration) -> DateTime<FixedOffset> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC.fixed_offset())
}
