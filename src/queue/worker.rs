//! Polling workers for the logical queues and the stalled-lease resetter.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use super::{JobHandler, JobOutcome, JobQueue, QueueKind};
use crate::config::QueueConfig;
use crate::error::BackfillError;
use crate::telemetry::job_span;

/// Runs the handler of one logical queue, one job at a time.
pub struct QueueWorker {
    queue: JobQueue,
    kind: QueueKind,
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
}

impl QueueWorker {
    pub fn new(
        queue: JobQueue,
        kind: QueueKind,
        handler: Arc<dyn JobHandler>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            kind,
            handler,
            config,
        }
    }

    fn max_retries(&self) -> i32 {
        match self.kind {
            QueueKind::NewBackfill => self.config.new_queue_max_retries,
            QueueKind::InProgress => self.config.in_progress_max_retries,
        }
    }

    /// Poll the queue until the shutdown token fires. A job in flight is
    /// finished before the loop exits.
    #[instrument(skip_all, fields(queue = self.kind.name()))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting backfill queue worker");

        loop {
            let delay = self.next_poll_delay();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Backfill queue worker shutdown requested");
                    break;
                }
                _ = sleep(delay) => {
                    loop {
                        match self.poll_once().await {
                            Ok(true) if !shutdown.is_cancelled() => continue,
                            Ok(_) => break,
                            Err(err) => {
                                error!(error = ?err, "Backfill queue poll failed");
                                break;
                            }
                        }
                    }
                    if let Ok(depth) = self.queue.queue_depth(self.kind).await {
                        gauge!("insights_backfill_queue_depth", "queue" => self.kind.name())
                            .set(depth as f64);
                    }
                }
            }
        }

        info!("Backfill queue worker stopped");
    }

    /// Dequeue and process a single job. Returns whether a job was found.
    pub async fn poll_once(&self) -> Result<bool, BackfillError> {
        let Some(job) = self.queue.dequeue(self.kind).await? else {
            return Ok(false);
        };

        let heartbeat = CancellationToken::new();
        let heartbeat_task = tokio::spawn(run_heartbeat(
            self.queue.clone(),
            job.id,
            self.config.heartbeat_interval(),
            heartbeat.clone(),
        ));

        let started = Instant::now();
        let result = self
            .handler
            .handle(&job)
            .instrument(job_span(self.kind.name(), job.id, job.backfill_id))
            .await;

        heartbeat.cancel();
        if let Err(err) = heartbeat_task.await {
            warn!(job_id = job.id, error = %err, "Heartbeat task ended abnormally");
        }

        histogram!("insights_backfill_job_duration_ms", "queue" => self.kind.name())
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(JobOutcome::Complete) => {
                // Handlers that finish inside their own transaction have
                // already completed the job; this is then a no-op.
                self.queue.mark_complete(self.queue.db(), job.id).await?;
                counter!("insights_backfill_jobs_completed_total", "queue" => self.kind.name())
                    .increment(1);
            }
            Ok(JobOutcome::Requeue(delay)) => {
                self.queue.requeue(job.id, delay).await?;
            }
            Ok(JobOutcome::Incomplete(message)) => {
                info!(
                    job_id = job.id,
                    backfill_id = job.backfill_id,
                    %message,
                    "Job left work behind, retrying later"
                );
                self.queue.requeue(job.id, self.config.retry_backoff()).await?;
            }
            Err(err) => {
                error!(job_id = job.id, backfill_id = job.backfill_id, error = ?err, "Backfill job failed");
                self.queue
                    .mark_errored(
                        job.id,
                        &err.to_string(),
                        self.max_retries(),
                        self.config.retry_backoff(),
                    )
                    .await?;
            }
        }

        Ok(true)
    }

    fn next_poll_delay(&self) -> Duration {
        let base = self.config.poll_interval().as_secs_f64();
        let jitter = base * self.config.poll_jitter_pct;
        if jitter <= 0.0 {
            return self.config.poll_interval();
        }
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

async fn run_heartbeat(
    queue: JobQueue,
    job_id: i32,
    interval: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep(interval) => {
                if let Err(err) = queue.heartbeat(&[job_id]).await {
                    warn!(job_id, error = ?err, "Failed to heartbeat job");
                }
            }
        }
    }
}

/// Periodically returns stalled leases to their queue.
pub struct StalledJobResetter {
    queue: JobQueue,
    config: QueueConfig,
}

impl StalledJobResetter {
    pub fn new(queue: JobQueue, config: QueueConfig) -> Self {
        Self { queue, config }
    }

    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting stalled job resetter");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stalled job resetter shutdown requested");
                    break;
                }
                _ = sleep(self.config.reset_interval()) => {
                    match self
                        .queue
                        .reset_stalled(self.config.stall_threshold(), self.config.max_resets)
                        .await
                    {
                        Ok(outcome) => debug!(
                            reset = outcome.reset.len(),
                            failed = outcome.failed.len(),
                            "Stalled job sweep finished"
                        ),
                        Err(err) => error!(error = ?err, "Stalled job sweep failed"),
                    }
                }
            }
        }

        info!("Stalled job resetter stopped");
    }
}
