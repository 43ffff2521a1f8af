mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use chrono::TimeDelta;
use insights_backfiller::clock::Clock;
use insights_backfiller::config::{BackfillConfig, QueueConfig};
use insights_backfiller::handlers::InProgressHandler;
use insights_backfiller::models::{BackfillState, IncompleteReason, JobState, SeriesBackfill};
use insights_backfiller::queue::{Job, JobHandler, JobOutcome, JobQueue, QueueKind, QueueWorker};
use insights_backfiller::store::{BackfillStore, SeriesStore};
use sea_orm::DatabaseConnection;
use test_utils::{
    GaugeRunner, Repos, ScriptedRunner, backfill_config, create_series, mock_clock,
    setup_test_db,
};

/// A scoped backfill over `repo_ids` with its in-progress job leased.
async fn leased_backfill(
    db: &Arc<DatabaseConnection>,
    clock: Arc<dyn Clock>,
    queue: &JobQueue,
    repo_ids: &[i32],
) -> Result<(SeriesBackfill, Job)> {
    let store = BackfillStore::new(clock.clone());
    let series = create_series(db, clock, "in-progress").await?;
    let backfill = store.new_backfill(db.as_ref(), &series).await?;
    let backfill = store
        .set_scope(db.as_ref(), &backfill, repo_ids, repo_ids.len() as f64)
        .await?;
    queue.enqueue(db.as_ref(), backfill.id).await?;
    let job = queue
        .dequeue(QueueKind::InProgress)
        .await?
        .expect("in-progress job");
    Ok((backfill, job))
}

fn handler(
    db: &Arc<DatabaseConnection>,
    queue: &JobQueue,
    repos: Repos,
    runner: Arc<ScriptedRunner>,
    config: BackfillConfig,
) -> InProgressHandler {
    InProgressHandler::new(db.clone(), queue.clone(), Arc::new(repos), runner, config)
}

#[tokio::test]
async fn test_backfill_runs_to_completion() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) = leased_backfill(&db, clock.clone(), &queue, &[1, 2, 3, 4, 5]).await?;

    let runner = Arc::new(ScriptedRunner::succeeding());
    let handler = handler(&db, &queue, Repos::without(&[4]), runner.clone(), backfill_config());
    let outcome = handler.handle(&job).await?;
    assert_eq!(outcome, JobOutcome::Complete);

    // The deleted repository is skipped, not run.
    assert_eq!(runner.calls(), vec![1, 2, 3, 5]);

    let store = BackfillStore::new(clock.clone());
    let backfill = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(backfill.state, BackfillState::Completed);
    let iterator = store.load_iterator(db.as_ref(), &backfill).await?;
    assert_eq!(iterator.success_count, 5);
    assert_eq!(iterator.percent_complete, 1.0);
    assert!(iterator.completed_at.is_some());
    assert!(!iterator.has_more());

    let series_store = SeriesStore::new(clock.clone());
    let series = series_store
        .get_data_series_by_id(db.as_ref(), backfill.series_id)
        .await?;
    assert!(series.backfill_completed_at.is_some());
    assert!(
        series_store
            .load_incomplete_datapoints(db.as_ref(), series.id)
            .await?
            .is_empty()
    );
    assert_eq!(queue.load_job(job.id).await?.state, JobState::Completed);
    Ok(())
}

#[tokio::test]
async fn test_interrupted_backfill_resumes_from_cursor() -> Result<()> {
    let db = setup_test_db().await?;
    let (mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) = leased_backfill(&db, clock.clone(), &queue, &[1, 2, 3, 4]).await?;
    // Hand the lease back so the worker can take it.
    queue.requeue(job.id, std::time::Duration::ZERO).await?;

    let runner =
        Arc::new(ScriptedRunner::succeeding().with_tick(mock.clone(), TimeDelta::seconds(3)));
    let config = BackfillConfig {
        interrupt_after_seconds: 5,
        ..backfill_config()
    };
    let handler = handler(&db, &queue, Repos::default(), runner.clone(), config)
        .with_requeue_delay(std::time::Duration::from_secs(5));
    let worker = QueueWorker::new(
        queue.clone(),
        QueueKind::InProgress,
        Arc::new(handler),
        QueueConfig::default(),
    );
    let store = BackfillStore::new(clock.clone());

    // The first page takes 6s, past the 5s budget.
    assert!(worker.poll_once().await?);
    assert_eq!(runner.calls(), vec![1, 2]);
    let stored = queue.load_job(job.id).await?;
    assert_eq!(stored.state, JobState::Queued);
    assert_eq!(stored.num_failures, 0);
    let iterator = store.load_iterator(db.as_ref(), &backfill).await?;
    assert_eq!(iterator.cursor, 2);
    assert_eq!(iterator.success_count, 2);
    assert_eq!(
        store.load_backfill(db.as_ref(), backfill.id).await?.state,
        BackfillState::Processing
    );

    // Requeued behind the poll interval.
    assert!(!worker.poll_once().await?);
    mock.advance(TimeDelta::seconds(5));

    assert!(worker.poll_once().await?);
    assert_eq!(runner.calls(), vec![1, 2, 3, 4]);
    assert_eq!(queue.load_job(job.id).await?.state, JobState::Completed);

    let backfill = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(backfill.state, BackfillState::Completed);
    let iterator = store.load_iterator(db.as_ref(), &backfill).await?;
    assert_eq!(iterator.success_count, 4);
    // Four 3s runs plus the 5s requeue wait, measured from the first page.
    assert_eq!(iterator.runtime_duration, TimeDelta::seconds(17));
    Ok(())
}

#[tokio::test]
async fn test_page_runs_are_bounded_by_repo_concurrency() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) =
        leased_backfill(&db, clock.clone(), &queue, &[1, 2, 3, 4, 5, 6, 7, 8]).await?;

    let config = BackfillConfig {
        page_size: 8,
        repo_concurrency: 3,
        ..backfill_config()
    };
    let runner = Arc::new(GaugeRunner::new(std::time::Duration::from_millis(50)));
    let handler = InProgressHandler::new(
        db.clone(),
        queue.clone(),
        Arc::new(Repos::default()),
        runner.clone(),
        config,
    );
    assert_eq!(handler.handle(&job).await?, JobOutcome::Complete);

    assert_eq!(runner.runs(), 8);
    assert_eq!(runner.peak(), 3);
    let store = BackfillStore::new(clock.clone());
    let backfill = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(backfill.state, BackfillState::Completed);
    Ok(())
}

#[tokio::test]
async fn test_slow_pages_interrupt_at_default_concurrency() -> Result<()> {
    let db = setup_test_db().await?;
    let (mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) = leased_backfill(&db, clock.clone(), &queue, &[1, 2, 3, 4]).await?;

    let config = BackfillConfig {
        page_size: 2,
        repo_concurrency: 3,
        interrupt_after_seconds: 5,
        ..backfill_config()
    };
    let runner =
        Arc::new(ScriptedRunner::succeeding().with_tick(mock.clone(), TimeDelta::seconds(6)));
    let handler = handler(&db, &queue, Repos::default(), runner.clone(), config);
    let store = BackfillStore::new(clock.clone());

    assert!(matches!(handler.handle(&job).await?, JobOutcome::Requeue(_)));
    let stored = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(stored.state, BackfillState::Processing);
    let iterator = store.load_iterator(db.as_ref(), &stored).await?;
    assert!(iterator.percent_complete > 0.0 && iterator.percent_complete < 1.0);

    assert_eq!(handler.handle(&job).await?, JobOutcome::Complete);
    let stored = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(stored.state, BackfillState::Completed);
    let mut calls = runner.calls();
    calls.sort_unstable();
    assert_eq!(calls, vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_pending_errors_requeue_without_counting_a_job_failure() -> Result<()> {
    let db = setup_test_db().await?;
    let (mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) = leased_backfill(&db, clock.clone(), &queue, &[1, 2, 3]).await?;
    queue.requeue(job.id, std::time::Duration::ZERO).await?;

    let runner = Arc::new(ScriptedRunner::failing(&[3]));
    let queue_config = QueueConfig::default();
    let backoff = queue_config.retry_backoff_seconds as i64;
    let worker = QueueWorker::new(
        queue.clone(),
        QueueKind::InProgress,
        Arc::new(handler(&db, &queue, Repos::default(), runner.clone(), backfill_config())),
        queue_config,
    );

    // Repo 3 fails in the page and again in the retry pass.
    assert!(worker.poll_once().await?);
    let stored = queue.load_job(job.id).await?;
    assert_eq!(stored.state, JobState::Queued);
    assert_eq!(stored.num_failures, 0);
    assert!(stored.failure_message.is_none());
    assert!(!worker.poll_once().await?);

    // The third failure makes the repo terminal and the backfill completes.
    mock.advance(TimeDelta::seconds(backoff));
    assert!(worker.poll_once().await?);
    assert_eq!(runner.calls(), vec![1, 2, 3, 3, 3]);
    let stored = queue.load_job(job.id).await?;
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.num_failures, 0);
    assert_eq!(
        BackfillStore::new(clock)
            .load_backfill(db.as_ref(), backfill.id)
            .await?
            .state,
        BackfillState::Completed
    );
    Ok(())
}

#[tokio::test]
async fn test_error_limit_fails_backfill() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) =
        leased_backfill(&db, clock.clone(), &queue, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).await?;

    let config = BackfillConfig {
        page_size: 10,
        error_threshold_floor: 3,
        ..backfill_config()
    };
    let runner = Arc::new(ScriptedRunner::always_failing());
    let handler = handler(&db, &queue, Repos::default(), runner.clone(), config);
    let outcome = handler.handle(&job).await?;
    assert_eq!(outcome, JobOutcome::Complete);
    assert_eq!(runner.calls().len(), 9);

    let store = BackfillStore::new(clock.clone());
    let backfill = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(backfill.state, BackfillState::Failed);
    let iterator = store.load_iterator(db.as_ref(), &backfill).await?;
    assert_eq!(iterator.percent_complete, 1.0);
    assert!(iterator.completed_at.is_some());
    assert_eq!(iterator.total_errors(), 9);

    let points = SeriesStore::new(clock.clone())
        .load_incomplete_datapoints(db.as_ref(), backfill.series_id)
        .await?;
    assert_eq!(points.len(), 12);
    assert!(points.iter().all(|point| point.repo_id.is_none()));
    assert!(
        points
            .iter()
            .all(|point| point.reason == IncompleteReason::ExceedsErrorLimit)
    );
    assert_eq!(queue.load_job(job.id).await?.state, JobState::Completed);

    // A failed backfill can be driven again from scratch, without the
    // error-limit markers of the failed attempt.
    let retried = store.retry_backfill_attempt(db.as_ref(), &backfill).await?;
    assert_eq!(retried.state, BackfillState::Processing);
    assert_eq!(queue.queue_depth(QueueKind::InProgress).await?, 1);
    assert!(
        SeriesStore::new(clock.clone())
            .load_incomplete_datapoints(db.as_ref(), backfill.series_id)
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn test_repeated_failure_becomes_terminal_marker() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) = leased_backfill(&db, clock.clone(), &queue, &[1, 2, 3]).await?;

    let runner = Arc::new(ScriptedRunner::failing(&[3]));
    let handler = handler(&db, &queue, Repos::default(), runner.clone(), backfill_config());
    let store = BackfillStore::new(clock.clone());
    let series_store = SeriesStore::new(clock.clone());

    // Primary pass plus one retry leaves repo 3 failing twice.
    let outcome = handler.handle(&job).await?;
    assert!(matches!(outcome, JobOutcome::Incomplete(_)));
    assert_eq!(runner.calls(), vec![1, 2, 3, 3]);
    assert_eq!(
        store.load_backfill(db.as_ref(), backfill.id).await?.state,
        BackfillState::Processing
    );
    assert!(
        series_store
            .load_incomplete_datapoints(db.as_ref(), backfill.series_id)
            .await?
            .is_empty()
    );

    // The third failure reaches the cap; the repo is given up on.
    let outcome = handler.handle(&job).await?;
    assert_eq!(outcome, JobOutcome::Complete);
    assert_eq!(runner.calls(), vec![1, 2, 3, 3, 3]);

    let backfill = store.load_backfill(db.as_ref(), backfill.id).await?;
    assert_eq!(backfill.state, BackfillState::Completed);
    let iterator = store.load_iterator(db.as_ref(), &backfill).await?;
    assert_eq!(iterator.success_count, 2);
    assert_eq!(iterator.terminal_errors().len(), 1);

    let points = series_store
        .load_incomplete_datapoints(db.as_ref(), backfill.series_id)
        .await?;
    assert_eq!(points.len(), 12);
    assert!(points.iter().all(|point| point.repo_id == Some(3)));
    assert!(points.iter().all(|point| point.reason == IncompleteReason::Generic));

    let errors = store.load_backfill_errors(db.as_ref(), &backfill, 10).await?;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].terminal);
    assert_eq!(errors[0].failure_count, 3);
    assert_eq!(errors[0].messages.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_timeouts_are_marked_with_timeout_reason() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) = leased_backfill(&db, clock.clone(), &queue, &[1, 2]).await?;

    let config = BackfillConfig {
        max_failures: 1,
        ..backfill_config()
    };
    let runner = Arc::new(ScriptedRunner::timing_out(&[2]));
    let handler = handler(&db, &queue, Repos::default(), runner, config);
    assert_eq!(handler.handle(&job).await?, JobOutcome::Complete);

    let points = SeriesStore::new(clock.clone())
        .load_incomplete_datapoints(db.as_ref(), backfill.series_id)
        .await?;
    assert_eq!(points.len(), 12);
    assert!(points.iter().all(|point| point.reason == IncompleteReason::Timeout));
    assert_eq!(
        BackfillStore::new(clock)
            .load_backfill(db.as_ref(), backfill.id)
            .await?
            .state,
        BackfillState::Completed
    );
    Ok(())
}

#[tokio::test]
async fn test_non_processing_backfill_is_skipped() -> Result<()> {
    let db = setup_test_db().await?;
    let (_mock, clock) = mock_clock();
    let queue = JobQueue::new(db.clone(), clock.clone());
    let (backfill, job) = leased_backfill(&db, clock.clone(), &queue, &[1, 2]).await?;
    BackfillStore::new(clock.clone())
        .set_failed(db.as_ref(), &backfill)
        .await?;

    let runner = Arc::new(ScriptedRunner::succeeding());
    let handler = handler(&db, &queue, Repos::default(), runner.clone(), backfill_config());
    assert_eq!(handler.handle(&job).await?, JobOutcome::Complete);
    assert!(runner.calls().is_empty());
    Ok(())
}
