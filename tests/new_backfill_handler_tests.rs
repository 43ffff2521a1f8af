mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use insights_backfiller::config::AppConfig;
use insights_backfiller::cost::HeuristicCostAnalyzer;
use insights_backfiller::error::BackfillError;
use insights_backfiller::handlers::NewBackfillHandler;
use insights_backfiller::models::{BackfillState, JobState};
use insights_backfiller::queue::{JobHandler, JobOutcome, JobQueue, QueueKind};
use insights_backfiller::scheduler::{BackfillScheduler, Collaborators};
use insights_backfiller::store::{BackfillStore, SeriesStore};
use test_utils::{
    FailingScope, FixedCost, Repos, ScriptedRunner, StaticScope, backfill_config, create_series,
    mock_clock, repo_refs, setup_test_db,
};

#[tokio::test]
async fn test_new_backfill_is_sized_and_handed_to_in_progress_queue() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let config = Arc::new(AppConfig {
        backfill: backfill_config(),
        ..AppConfig::default()
    });
    let scheduler = BackfillScheduler::new(
        config,
        db.clone(),
        clock.clone(),
        Collaborators {
            scope: Arc::new(StaticScope(repo_refs(&[11, 12, 13]))),
            cost: Arc::new(FixedCost(42.0)),
            repos: Arc::new(Repos::default()),
            runner: Arc::new(ScriptedRunner::succeeding()),
        },
    );
    let series = create_series(&db, clock.clone(), "new-a").await?;
    let backfill = scheduler.initial_backfill(&series).await?;
    assert_eq!(backfill.state, BackfillState::New);

    let queue = scheduler.queue().clone();
    let job = queue
        .dequeue(QueueKind::NewBackfill)
        .await?
        .expect("initial backfill queued a job");
    let outcome = scheduler.new_backfill_handler().handle(&job).await?;
    assert_eq!(outcome, JobOutcome::Complete);

    let store = BackfillStore::new(clock.clone());
    let backfill = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(backfill.state, BackfillState::Processing);
    assert_eq!(backfill.estimated_cost, 42.0);
    let iterator = store.load_iterator(db.as_ref(), &backfill).await?;
    assert_eq!(iterator.total_count, 3);
    assert_eq!(iterator.repo_ids(), &[11, 12, 13]);
    assert_eq!(iterator.cursor, 0);

    let series_store = SeriesStore::new(clock.clone());
    let times = series_store.load_recording_times(db.as_ref(), series.id).await?;
    assert_eq!(times.len(), 12);
    assert!(times.windows(2).all(|pair| pair[0] < pair[1]));
    let series = series_store.get_data_series_by_id(db.as_ref(), series.id).await?;
    assert!(series.backfill_queued_at.is_some());
    assert!(series.backfill_completed_at.is_none());

    assert_eq!(queue.load_job(job.id).await?.state, JobState::Completed);
    assert!(queue.dequeue(QueueKind::NewBackfill).await?.is_none());
    let next = queue
        .dequeue(QueueKind::InProgress)
        .await?
        .expect("backfill moved to the in-progress queue");
    assert_eq!(next.backfill_id, backfill.id);
    Ok(())
}

#[tokio::test]
async fn test_scope_failure_leaves_backfill_new() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let store = BackfillStore::new(clock.clone());
    let series = create_series(&db, clock.clone(), "new-b").await?;
    let backfill = store.new_backfill(db.as_ref(), &series).await?;
    queue.enqueue(db.as_ref(), backfill.id).await?;

    let handler = NewBackfillHandler::new(
        db.clone(),
        queue.clone(),
        Arc::new(FailingScope),
        Arc::new(HeuristicCostAnalyzer),
        backfill_config(),
    );
    let job = queue.dequeue(QueueKind::NewBackfill).await?.expect("job");
    let err = handler.handle(&job).await.unwrap_err();
    assert!(matches!(err, BackfillError::ScopeResolution(_)));

    let reloaded = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(reloaded.state, BackfillState::New);
    assert!(reloaded.repo_iterator_id.is_none());
    assert_eq!(queue.load_job(job.id).await?.state, JobState::Processing);
    assert_eq!(queue.queue_depth(QueueKind::InProgress).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_heuristic_cost_is_recorded() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let store = BackfillStore::new(clock.clone());
    let series = create_series(&db, clock.clone(), "new-c").await?;
    let backfill = store.new_backfill(db.as_ref(), &series).await?;
    queue.enqueue(db.as_ref(), backfill.id).await?;

    let handler = NewBackfillHandler::new(
        db.clone(),
        queue.clone(),
        Arc::new(StaticScope(repo_refs(&[1, 2, 3, 4]))),
        Arc::new(HeuristicCostAnalyzer),
        backfill_config(),
    );
    let job = queue.dequeue(QueueKind::NewBackfill).await?.expect("job");
    handler.handle(&job).await?;

    let reloaded = store.load_backfill(db.as_ref(), backfill.id).await?;
    // Regexp pattern over four repositories.
    assert_eq!(reloaded.estimated_cost, 8.0);
    Ok(())
}

#[tokio::test]
async fn test_already_scoped_backfill_is_skipped() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let store = BackfillStore::new(clock.clone());
    let series = create_series(&db, clock.clone(), "new-d").await?;
    let backfill = store.new_backfill(db.as_ref(), &series).await?;
    let stale_job = queue.enqueue(db.as_ref(), backfill.id).await?;
    let backfill = store.set_scope(db.as_ref(), &backfill, &[5], 3.0).await?;

    let handler = NewBackfillHandler::new(
        db.clone(),
        queue.clone(),
        Arc::new(StaticScope(repo_refs(&[5, 6]))),
        Arc::new(FixedCost(99.0)),
        backfill_config(),
    );
    let outcome = handler.handle(&stale_job).await?;
    assert_eq!(outcome, JobOutcome::Complete);

    let reloaded = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(reloaded, backfill);
    Ok(())
}
