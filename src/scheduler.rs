//! # Backfill Scheduler
//!
//! Entry point for creating backfills and for starting the background
//! routines: one worker per logical queue plus the stalled-lease resetter.
//! Routines run until the shared shutdown token fires.

use std::sync::Arc;

use sea_orm::{DatabaseConnection, TransactionTrait};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::clock::Clock;
use crate::collaborators::{BackfillRunner, CostAnalyzer, RepoResolver, ScopeResolver};
use crate::config::AppConfig;
use crate::error::{BackfillError, map_db_err};
use crate::handlers::{InProgressHandler, NewBackfillHandler};
use crate::models::{Series, SeriesBackfill};
use crate::queue::{JobQueue, QueueKind, QueueWorker, StalledJobResetter};
use crate::store::BackfillStore;

/// External services the handlers depend on.
#[derive(Clone)]
pub struct Collaborators {
    pub scope: Arc<dyn ScopeResolver>,
    pub cost: Arc<dyn CostAnalyzer>,
    pub repos: Arc<dyn RepoResolver>,
    pub runner: Arc<dyn BackfillRunner>,
}

pub struct BackfillScheduler {
    config: Arc<AppConfig>,
    db: Arc<DatabaseConnection>,
    queue: JobQueue,
    backfills: BackfillStore,
    collaborators: Collaborators,
}

impl BackfillScheduler {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            queue: JobQueue::new(db.clone(), clock.clone()),
            backfills: BackfillStore::new(clock),
            config,
            db,
            collaborators,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Create a New backfill for `series` and queue it for sizing.
    #[instrument(skip_all, fields(series_id = series.id))]
    pub async fn initial_backfill(&self, series: &Series) -> Result<SeriesBackfill, BackfillError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("begin initial backfill", err))?;
        let backfill = self.backfills.new_backfill(&txn, series).await?;
        self.queue.enqueue(&txn, backfill.id).await?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit initial backfill", err))?;
        Ok(backfill)
    }

    pub fn new_backfill_handler(&self) -> NewBackfillHandler {
        NewBackfillHandler::new(
            self.db.clone(),
            self.queue.clone(),
            self.collaborators.scope.clone(),
            self.collaborators.cost.clone(),
            self.config.backfill.clone(),
        )
    }

    pub fn in_progress_handler(&self) -> InProgressHandler {
        InProgressHandler::new(
            self.db.clone(),
            self.queue.clone(),
            self.collaborators.repos.clone(),
            self.collaborators.runner.clone(),
            self.config.backfill.clone(),
        )
        .with_requeue_delay(self.config.queue.poll_interval())
    }

    /// Spawn both queue workers and the resetter.
    pub fn start_routines(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let queue_config = self.config.queue.clone();

        let new_worker = QueueWorker::new(
            self.queue.clone(),
            QueueKind::NewBackfill,
            Arc::new(self.new_backfill_handler()),
            queue_config.clone(),
        );
        let in_progress_worker = QueueWorker::new(
            self.queue.clone(),
            QueueKind::InProgress,
            Arc::new(self.in_progress_handler()),
            queue_config.clone(),
        );
        let resetter = StalledJobResetter::new(self.queue.clone(), queue_config);

        info!("Starting backfill routines");
        vec![
            tokio::spawn(new_worker.run(shutdown.clone())),
            tokio::spawn(in_progress_worker.run(shutdown.clone())),
            tokio::spawn(resetter.run(shutdown)),
        ]
    }
}
