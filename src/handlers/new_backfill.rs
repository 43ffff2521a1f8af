use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use sea_orm::{DatabaseConnection, TransactionTrait};
use tracing::{debug, info, instrument};

use crate::collaborators::{CostAnalyzer, QueryObject, ScopeResolver};
use crate::config::BackfillConfig;
use crate::error::{BackfillError, map_db_err};
use crate::models::BackfillState;
use crate::queue::{Job, JobHandler, JobOutcome, JobQueue};
use crate::sampling::sample_times_for_series;
use crate::store::{BackfillStore, SeriesStore};

/// Handler of the new-backfill queue.
///
/// Resolves the repository scope of the series, prices it, moves the backfill
/// to Processing and enqueues it for execution. All writes share one
/// transaction, so a failed attempt leaves the backfill New and retryable.
pub struct NewBackfillHandler {
    db: Arc<DatabaseConnection>,
    backfills: BackfillStore,
    series: SeriesStore,
    queue: JobQueue,
    scope: Arc<dyn ScopeResolver>,
    cost: Arc<dyn CostAnalyzer>,
    config: BackfillConfig,
}

impl NewBackfillHandler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: JobQueue,
        scope: Arc<dyn ScopeResolver>,
        cost: Arc<dyn CostAnalyzer>,
        config: BackfillConfig,
    ) -> Self {
        let clock = queue.clock().clone();
        Self {
            db,
            backfills: BackfillStore::new(clock.clone()),
            series: SeriesStore::new(clock),
            queue,
            scope,
            cost,
            config,
        }
    }
}

#[async_trait]
impl JobHandler for NewBackfillHandler {
    #[instrument(skip_all, fields(job_id = job.id, backfill_id = job.backfill_id))]
    async fn handle(&self, job: &Job) -> Result<JobOutcome, BackfillError> {
        let db = self.db.as_ref();
        let backfill = self.backfills.load_backfill(db, job.backfill_id).await?;
        if backfill.state != BackfillState::New {
            debug!(state = %backfill.state, "Backfill already sized, dropping job");
            return Ok(JobOutcome::Complete);
        }
        let series = self
            .series
            .get_data_series_by_id(db, backfill.series_id)
            .await?;

        let repos = self
            .scope
            .repositories(&series)
            .await
            .map_err(BackfillError::ScopeResolution)?;
        let repo_ids: Vec<i32> = repos.iter().map(|repo| repo.id).collect();
        let cost = self
            .cost
            .cost(&QueryObject {
                query: series.query.clone(),
                repo_count: repo_ids.len(),
            })
            .map_err(BackfillError::CostEstimation)?;

        let sample_times = sample_times_for_series(&series, self.config.sample_count);

        let txn = db
            .begin()
            .await
            .map_err(|err| map_db_err("begin new backfill", err))?;
        let scoped = self
            .backfills
            .set_scope(&txn, &backfill, &repo_ids, cost)
            .await?;
        self.series
            .set_insight_series_recording_times(&txn, series.id, &sample_times)
            .await?;
        self.series.stamp_backfill_queued(&txn, series.id).await?;
        let next = self.queue.enqueue(&txn, scoped.id).await?;
        self.queue.mark_complete(&txn, job.id).await?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit new backfill", err))?;

        counter!("insights_backfill_scoped_total").increment(1);
        info!(
            series_id = %series.series_id,
            repos = repo_ids.len(),
            cost,
            next_job_id = next.id,
            "Backfill sized and queued for execution"
        );
        Ok(JobOutcome::Complete)
    }
}
