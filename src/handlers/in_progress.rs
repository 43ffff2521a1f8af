use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::collaborators::{
    BackfillRequest, BackfillRunner, RepoLookupError, RepoResolver, RunError,
};
use crate::config::BackfillConfig;
use crate::error::{BackfillError, map_db_err};
use crate::iterator::{
    FailureKind, IterationConfig, RepoFailure, RepoIterator, TerminalErrorHook,
};
use crate::models::{BackfillState, IncompleteReason, Series, SeriesBackfill};
use crate::queue::{Job, JobHandler, JobOutcome, JobQueue};
use crate::sampling::sample_times_for_series;
use crate::store::{BackfillStore, IncompleteDatapoint, SeriesStore};

/// Handler of the in-progress queue.
///
/// Each invocation works through the primary pass of the backfill's iterator
/// page by page, then replays the repositories that errored. It stops early
/// when its time budget runs out (the job is requeued and resumes from the
/// persisted cursor) or when more repositories errored than the backfill
/// tolerates (the backfill is failed).
pub struct InProgressHandler {
    db: Arc<DatabaseConnection>,
    backfills: BackfillStore,
    series: SeriesStore,
    queue: JobQueue,
    repos: Arc<dyn RepoResolver>,
    runner: Arc<dyn BackfillRunner>,
    clock: Arc<dyn Clock>,
    config: BackfillConfig,
    requeue_delay: Duration,
}

/// How an invocation left the backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exhausted,
    Interrupted,
    ErrorLimit,
}

impl InProgressHandler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: JobQueue,
        repos: Arc<dyn RepoResolver>,
        runner: Arc<dyn BackfillRunner>,
        config: BackfillConfig,
    ) -> Self {
        let clock = queue.clock().clone();
        Self {
            db,
            backfills: BackfillStore::new(clock.clone()),
            series: SeriesStore::new(clock.clone()),
            queue,
            repos,
            runner,
            clock,
            config,
            requeue_delay: Duration::ZERO,
        }
    }

    /// Delay before an interrupted backfill becomes ready again.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    fn iteration_config(
        &self,
        series: &Series,
        sample_times: &Arc<Vec<DateTime<Utc>>>,
    ) -> IterationConfig {
        IterationConfig {
            max_failures: self.config.max_failures,
            on_terminal: Some(Arc::new(IncompleteMarker {
                series: self.series.clone(),
                series_id: series.id,
                sample_times: sample_times.clone(),
            })),
        }
    }

    fn error_limit_reached(&self, iterator: &RepoIterator) -> bool {
        let total = iterator.total_count.max(0) as usize;
        iterator.total_errors() > self.config.error_threshold(total)
    }

    async fn drive(
        &self,
        iterator: &mut RepoIterator,
        series: &Arc<Series>,
        sample_times: &Arc<Vec<DateTime<Utc>>>,
    ) -> Result<Stop, BackfillError> {
        let now = self.clock.now();
        let deadline = TimeDelta::from_std(self.config.interrupt_after())
            .ok()
            .and_then(|budget| now.checked_add_signed(budget))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let cfg = self.iteration_config(series, sample_times);

        while iterator.has_more() {
            if self.clock.now() >= deadline {
                return Ok(Stop::Interrupted);
            }
            let Some(page) = iterator.next_page(self.config.page_size) else {
                break;
            };

            let started = Instant::now();
            let failures = self.run_page(&page.repo_ids, series, sample_times).await;
            counter!("insights_backfill_repo_errors_total").increment(failures.len() as u64);
            iterator
                .finish_page(self.db.as_ref(), page, failures, &cfg)
                .await?;
            histogram!("insights_backfill_page_duration_ms")
                .record(started.elapsed().as_secs_f64() * 1_000.0);

            if self.error_limit_reached(iterator) {
                return Ok(Stop::ErrorLimit);
            }
        }

        while iterator.has_errors() {
            if self.clock.now() >= deadline {
                return Ok(Stop::Interrupted);
            }
            let Some(item) = iterator.next_retry() else {
                break;
            };
            let outcome = match self.retry_repo(item.repo_id, series, sample_times).await {
                Some(failure) => Err(failure),
                None => Ok(()),
            };
            iterator
                .finish_retry(self.db.as_ref(), item, outcome, &cfg)
                .await?;

            if self.error_limit_reached(iterator) {
                return Ok(Stop::ErrorLimit);
            }
        }

        Ok(Stop::Exhausted)
    }

    /// Run every repository of a page, at most `repo_concurrency` at a time.
    async fn run_page(
        &self,
        repo_ids: &[i32],
        series: &Arc<Series>,
        sample_times: &Arc<Vec<DateTime<Utc>>>,
    ) -> HashMap<i32, RepoFailure> {
        let semaphore = Arc::new(Semaphore::new(self.config.repo_concurrency.max(1)));
        let mut handles = Vec::with_capacity(repo_ids.len());

        for &repo_id in repo_ids {
            let semaphore = semaphore.clone();
            let repos = self.repos.clone();
            let runner = self.runner.clone();
            let series = series.clone();
            let sample_times = sample_times.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_repo(repos.as_ref(), runner.as_ref(), &series, &sample_times, repo_id).await
            });
            handles.push((repo_id, handle));
        }

        let mut failures = HashMap::new();
        for (repo_id, handle) in handles {
            match handle.await {
                Ok(None) => {}
                Ok(Some(failure)) => {
                    failures.insert(repo_id, failure);
                }
                Err(err) => {
                    error!(repo_id, error = ?err, "Repository task panicked or was cancelled");
                    failures.insert(repo_id, RepoFailure::generic(err.to_string()));
                }
            }
        }
        failures
    }

    async fn retry_repo(
        &self,
        repo_id: i32,
        series: &Arc<Series>,
        sample_times: &Arc<Vec<DateTime<Utc>>>,
    ) -> Option<RepoFailure> {
        let failure = run_repo(
            self.repos.as_ref(),
            self.runner.as_ref(),
            series,
            sample_times,
            repo_id,
        )
        .await;
        if failure.is_some() {
            counter!("insights_backfill_repo_errors_total").increment(1);
        }
        failure
    }

    /// Finalize a backfill whose repositories are all resolved.
    async fn complete(
        &self,
        job: &Job,
        backfill: &SeriesBackfill,
        iterator: &mut RepoIterator,
    ) -> Result<(), BackfillError> {
        let txn = self.begin("begin backfill completion").await?;
        iterator.mark_complete(&txn).await?;
        self.series
            .set_series_backfill_complete(&txn, backfill.series_id, self.clock.now())
            .await?;
        self.backfills.set_completed(&txn, backfill).await?;
        self.queue.mark_complete(&txn, job.id).await?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit backfill completion", err))?;

        counter!("insights_backfill_completed_total").increment(1);
        info!(
            iterator_id = iterator.id,
            successes = iterator.success_count,
            terminal_errors = iterator.terminal_errors().len(),
            runtime_ms = iterator.runtime_duration.num_milliseconds(),
            "Backfill completed"
        );
        Ok(())
    }

    /// Abandon a backfill that exceeded its error budget. Every sample time of
    /// the series is marked incomplete.
    async fn fail(
        &self,
        job: &Job,
        backfill: &SeriesBackfill,
        iterator: &mut RepoIterator,
        sample_times: &[DateTime<Utc>],
    ) -> Result<(), BackfillError> {
        let txn = self.begin("begin backfill failure").await?;
        iterator.mark_complete(&txn).await?;
        for time in sample_times {
            self.series
                .add_incomplete_datapoint(
                    &txn,
                    IncompleteDatapoint {
                        series_id: backfill.series_id,
                        repo_id: None,
                        reason: IncompleteReason::ExceedsErrorLimit,
                        time: *time,
                    },
                )
                .await?;
        }
        self.backfills.set_failed(&txn, backfill).await?;
        self.queue.mark_complete(&txn, job.id).await?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit backfill failure", err))?;

        counter!("insights_backfill_breaker_trips_total").increment(1);
        warn!(
            iterator_id = iterator.id,
            errors = iterator.total_errors(),
            total = iterator.total_count,
            "Backfill exceeded its error limit and was failed"
        );
        Ok(())
    }

    async fn begin(&self, context: &'static str) -> Result<DatabaseTransaction, BackfillError> {
        self.db
            .begin()
            .await
            .map_err(|err| map_db_err(context, err))
    }
}

#[async_trait]
impl JobHandler for InProgressHandler {
    #[instrument(skip_all, fields(job_id = job.id, backfill_id = job.backfill_id))]
    async fn handle(&self, job: &Job) -> Result<JobOutcome, BackfillError> {
        let db = self.db.as_ref();
        let backfill = self.backfills.load_backfill(db, job.backfill_id).await?;
        if backfill.state != BackfillState::Processing {
            debug!(state = %backfill.state, "Backfill no longer processing, dropping job");
            return Ok(JobOutcome::Complete);
        }
        let series = Arc::new(
            self.series
                .get_data_series_by_id(db, backfill.series_id)
                .await?,
        );
        let mut iterator = self.backfills.load_iterator(db, &backfill).await?;
        let sample_times = Arc::new(sample_times_for_series(&series, self.config.sample_count));

        debug!(
            iterator_id = iterator.id,
            cursor = iterator.cursor,
            total = iterator.total_count,
            pending_errors = iterator.pending_errors().len(),
            "Resuming backfill"
        );

        match self.drive(&mut iterator, &series, &sample_times).await? {
            Stop::ErrorLimit => {
                self.fail(job, &backfill, &mut iterator, &sample_times).await?;
                Ok(JobOutcome::Complete)
            }
            Stop::Interrupted => {
                counter!("insights_backfill_interrupts_total").increment(1);
                debug!(cursor = iterator.cursor, "Backfill interrupted, requeueing");
                Ok(JobOutcome::Requeue(self.requeue_delay))
            }
            Stop::Exhausted if !iterator.has_errors() => {
                self.complete(job, &backfill, &mut iterator).await?;
                Ok(JobOutcome::Complete)
            }
            Stop::Exhausted => {
                let pending = iterator.pending_errors().len();
                Ok(JobOutcome::Incomplete(format!(
                    "{pending} repositories still have errors to retry"
                )))
            }
        }
    }
}

/// Backfill one repository. `None` means the repository is resolved: either it
/// ran, or it no longer exists.
async fn run_repo(
    repos: &dyn RepoResolver,
    runner: &dyn BackfillRunner,
    series: &Series,
    sample_times: &[DateTime<Utc>],
    repo_id: i32,
) -> Option<RepoFailure> {
    let repo = match repos.get(repo_id).await {
        Ok(repo) => repo,
        Err(RepoLookupError::NotFound(_)) => {
            debug!(repo_id, "Repository no longer exists, skipping");
            return None;
        }
        Err(RepoLookupError::Other(err)) => {
            return Some(RepoFailure::generic(format!("{err:#}")));
        }
    };

    let request = BackfillRequest {
        series: series.clone(),
        repo,
        sample_times: sample_times.to_vec(),
    };
    match runner.run(request).await {
        Ok(()) => None,
        Err(RunError::Timeout(message)) => Some(RepoFailure::timeout(message)),
        Err(RunError::Failed(err)) => Some(RepoFailure::generic(format!("{err:#}"))),
    }
}

/// Writes one incompleteness marker per sample time for a repository that
/// failed permanently.
struct IncompleteMarker {
    series: SeriesStore,
    series_id: i32,
    sample_times: Arc<Vec<DateTime<Utc>>>,
}

#[async_trait]
impl TerminalErrorHook for IncompleteMarker {
    async fn on_terminal(
        &self,
        txn: &DatabaseTransaction,
        repo_id: i32,
        failure: &RepoFailure,
    ) -> Result<(), BackfillError> {
        let reason = match failure.kind {
            FailureKind::Timeout => IncompleteReason::Timeout,
            FailureKind::Generic => IncompleteReason::Generic,
        };
        for time in self.sample_times.iter() {
            self.series
                .add_incomplete_datapoint(
                    txn,
                    IncompleteDatapoint {
                        series_id: self.series_id,
                        repo_id: Some(repo_id),
                        reason,
                        time: *time,
                    },
                )
                .await?;
        }
        Ok(())
    }
}
