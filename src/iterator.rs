//! # Persistent Repository Iterator
//!
//! A durable, resumable cursor over a fixed, ordered set of repository ids.
//!
//! Work is handed out in two shapes:
//!
//! - **pages** from the primary pass ([`RepoIterator::next_page`] /
//!   [`RepoIterator::finish_page`]), processed concurrently by the caller and
//!   committed as one atomic write;
//! - **retry items** ([`RepoIterator::next_retry`] /
//!   [`RepoIterator::finish_retry`]), one repository at a time, replaying
//!   repositories that hold an unresolved error, oldest first.
//!
//! Every repository that failed at least once has an [`IterationError`]. Once
//! its failure count reaches [`IterationConfig::max_failures`] the error is
//! promoted to terminal, the [`TerminalErrorHook`] runs inside the same
//! transaction, and the repository is never handed out again.
//!
//! In-memory state only changes after the corresponding transaction commits,
//! so a failed commit leaves the iterator exactly as it was.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait, Unchanged,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{BackfillError, map_db_err};
use crate::models::{
    RepoIteratorErrorRecord, RepoIteratorRecord, repo_iterator, repo_iterator_error,
};

/// Default number of failures after which a repository is given up on.
pub const DEFAULT_MAX_FAILURES: i32 = 3;

/// Classification of a repository failure, kept for the incompleteness reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Generic,
}

/// A single failed attempt at one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RepoFailure {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Generic,
            message: message.into(),
        }
    }
}

/// Failure history of one repository.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationError {
    pub repo_id: i32,
    pub failure_count: i32,
    /// Every recorded failure message, oldest first
    pub messages: Vec<String>,
    record_id: i32,
}

impl IterationError {
    pub fn last_message(&self) -> Option<&str> {
        self.messages.last().map(String::as_str)
    }

    fn from_record(record: repo_iterator_error::Model) -> Result<Self, serde_json::Error> {
        Ok(Self {
            repo_id: record.repo_id,
            failure_count: record.failure_count,
            messages: serde_json::from_value(record.error_messages)?,
            record_id: record.id,
        })
    }
}

/// Invoked when a repository reaches the failure cap, inside the commit transaction.
#[async_trait]
pub trait TerminalErrorHook: Send + Sync {
    async fn on_terminal(
        &self,
        txn: &DatabaseTransaction,
        repo_id: i32,
        failure: &RepoFailure,
    ) -> Result<(), BackfillError>;
}

/// Retry policy applied when committing failures.
#[derive(Clone)]
pub struct IterationConfig {
    /// Failures before a repository turns terminal.
    pub max_failures: i32,
    pub on_terminal: Option<Arc<dyn TerminalErrorHook>>,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            on_terminal: None,
        }
    }
}

impl fmt::Debug for IterationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationConfig")
            .field("max_failures", &self.max_failures)
            .field("on_terminal", &self.on_terminal.is_some())
            .finish()
    }
}

impl IterationConfig {
    fn is_terminal(&self, failure_count: i32) -> bool {
        failure_count >= self.max_failures.max(1)
    }
}

/// A batch of unvisited repositories. Must be handed back to
/// [`RepoIterator::finish_page`] exactly once.
#[derive(Debug)]
#[must_use = "a page must be committed with finish_page"]
pub struct Page {
    pub repo_ids: Vec<i32>,
    iterator_id: i32,
    start_cursor: i32,
    end_cursor: i32,
    opened_at: DateTime<Utc>,
}

/// One repository replayed by the retry pass.
#[derive(Debug)]
#[must_use = "a retry item must be committed with finish_retry"]
pub struct RetryItem {
    pub repo_id: i32,
    iterator_id: i32,
    opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    cursor: i32,
    success_count: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    runtime: TimeDelta,
    percent_complete: f64,
}

/// In-memory view of a persisted repository iterator.
#[derive(Debug)]
pub struct RepoIterator {
    pub id: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub runtime_duration: TimeDelta,
    pub percent_complete: f64,
    pub total_count: i32,
    pub success_count: i32,
    pub cursor: i32,
    repos: Vec<i32>,
    pending: Vec<IterationError>,
    terminal: Vec<IterationError>,
    retried_this_pass: HashSet<i32>,
    clock: Arc<dyn Clock>,
}

impl RepoIterator {
    /// Persist a new iterator over `repo_ids`; the set and its order are frozen.
    pub async fn create<C: ConnectionTrait>(
        conn: &C,
        clock: Arc<dyn Clock>,
        repo_ids: &[i32],
    ) -> Result<Self, BackfillError> {
        let now = clock.now_db();
        let record = repo_iterator::ActiveModel {
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            last_updated_at: Set(now),
            runtime_duration_ms: Set(0),
            percent_complete: Set(0.0),
            total_count: Set(repo_ids.len() as i32),
            success_count: Set(0),
            repos: Set(json!(repo_ids)),
            repo_cursor: Set(0),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(|err| map_db_err("create repo iterator", err))?;

        debug!(iterator_id = record.id, total = repo_ids.len(), "Created repo iterator");
        Self::from_records(record, Vec::new(), clock)
    }

    /// Load an iterator with its error history.
    pub async fn load<C: ConnectionTrait>(
        conn: &C,
        clock: Arc<dyn Clock>,
        id: i32,
    ) -> Result<Self, BackfillError> {
        let record = RepoIteratorRecord::find_by_id(id)
            .one(conn)
            .await
            .map_err(|err| map_db_err("load repo iterator", err))?
            .ok_or(BackfillError::NotFound {
                entity: "repo iterator",
                id,
            })?;

        let errors = RepoIteratorErrorRecord::find()
            .filter(repo_iterator_error::Column::RepoIteratorId.eq(id))
            .order_by_asc(repo_iterator_error::Column::Id)
            .all(conn)
            .await
            .map_err(|err| map_db_err("load repo iterator errors", err))?;

        Self::from_records(record, errors, clock)
    }

    fn from_records(
        record: repo_iterator::Model,
        errors: Vec<repo_iterator_error::Model>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackfillError> {
        let iterator_id = record.id;
        let corrupt = |source| BackfillError::CorruptIterator {
            iterator_id,
            source,
        };

        let repos: Vec<i32> = serde_json::from_value(record.repos).map_err(corrupt)?;
        let mut pending = Vec::new();
        let mut terminal = Vec::new();
        for row in errors {
            let is_terminal = row.terminal;
            let error = IterationError::from_record(row).map_err(corrupt)?;
            if is_terminal {
                terminal.push(error);
            } else {
                pending.push(error);
            }
        }

        Ok(Self {
            id: record.id,
            created_at: record.created_at.with_timezone(&Utc),
            started_at: record.started_at.map(|t| t.with_timezone(&Utc)),
            completed_at: record.completed_at.map(|t| t.with_timezone(&Utc)),
            runtime_duration: TimeDelta::milliseconds(record.runtime_duration_ms),
            percent_complete: record.percent_complete,
            total_count: record.total_count,
            success_count: record.success_count,
            cursor: record.repo_cursor,
            repos,
            pending,
            terminal,
            retried_this_pass: HashSet::new(),
            clock,
        })
    }

    /// Up to `page_size` unvisited repositories starting at the cursor.
    pub fn next_page(&self, page_size: usize) -> Option<Page> {
        let start = self.cursor.max(0) as usize;
        if start >= self.repos.len() {
            return None;
        }
        let end = (start + page_size.max(1)).min(self.repos.len());
        Some(Page {
            repo_ids: self.repos[start..end].to_vec(),
            iterator_id: self.id,
            start_cursor: self.cursor,
            end_cursor: end as i32,
            opened_at: self.clock.now(),
        })
    }

    /// Single-repository variant of [`RepoIterator::next_page`].
    pub fn next(&self) -> Option<Page> {
        self.next_page(1)
    }

    /// Commit a page: advance the cursor past every repository in it, count
    /// the successes and record `failures` against their repositories.
    pub async fn finish_page<C: TransactionTrait>(
        &mut self,
        conn: &C,
        page: Page,
        mut failures: HashMap<i32, RepoFailure>,
        cfg: &IterationConfig,
    ) -> Result<(), BackfillError> {
        if page.iterator_id != self.id || page.start_cursor != self.cursor {
            return Err(self.stale(page.start_cursor));
        }

        let now = self.clock.now();
        let mut pending = self.pending.clone();
        let mut terminal = self.terminal.clone();
        let mut succeeded = 0;

        let txn = conn
            .begin()
            .await
            .map_err(|err| map_db_err("begin page commit", err))?;

        for repo_id in &page.repo_ids {
            let previous = take_error(&mut pending, *repo_id);
            match failures.remove(repo_id) {
                None => {
                    if let Some(previous) = previous {
                        self.delete_error(&txn, &previous).await?;
                    }
                    succeeded += 1;
                }
                Some(failure) => {
                    let (error, is_terminal) = self
                        .record_failure(&txn, previous, *repo_id, &failure, cfg)
                        .await?;
                    if is_terminal {
                        terminal.push(error);
                    } else {
                        pending.push(error);
                    }
                }
            }
        }
        pending.sort_by_key(|error| error.record_id);

        let success_count = self.success_count + succeeded;
        let progress = Progress {
            cursor: page.end_cursor,
            success_count,
            started_at: self.started_at.or(Some(page.opened_at)),
            completed_at: self.completed_at,
            runtime: self.runtime_duration + elapsed(page.opened_at, now),
            percent_complete: percent(success_count, self.total_count),
        };
        self.write_progress(&txn, &progress, Some(page.start_cursor))
            .await?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("commit page", err))?;

        counter!("insights_backfill_pages_committed_total").increment(1);
        debug!(
            iterator_id = self.id,
            cursor = progress.cursor,
            succeeded,
            failed = page.repo_ids.len() as i32 - succeeded,
            "Committed iterator page"
        );

        self.apply(progress);
        self.pending = pending;
        self.terminal = terminal;
        Ok(())
    }

    /// Single-repository variant of [`RepoIterator::finish_page`].
    pub async fn finish<C: TransactionTrait>(
        &mut self,
        conn: &C,
        page: Page,
        failure: Option<RepoFailure>,
        cfg: &IterationConfig,
    ) -> Result<(), BackfillError> {
        let failures = match (page.repo_ids.first(), failure) {
            (Some(repo_id), Some(failure)) => HashMap::from([(*repo_id, failure)]),
            _ => HashMap::new(),
        };
        self.finish_page(conn, page, failures, cfg).await
    }

    /// The oldest unresolved error not yet replayed in this pass.
    pub fn next_retry(&mut self) -> Option<RetryItem> {
        let error = self
            .pending
            .iter()
            .find(|error| !self.retried_this_pass.contains(&error.repo_id))?;
        let repo_id = error.repo_id;
        self.retried_this_pass.insert(repo_id);
        Some(RetryItem {
            repo_id,
            iterator_id: self.id,
            opened_at: self.clock.now(),
        })
    }

    /// Commit the outcome of one retry: clear the error on success, otherwise
    /// record another failure and promote it to terminal at the cap.
    pub async fn finish_retry<C: TransactionTrait>(
        &mut self,
        conn: &C,
        item: RetryItem,
        outcome: Result<(), RepoFailure>,
        cfg: &IterationConfig,
    ) -> Result<(), BackfillError> {
        if item.iterator_id != self.id {
            return Err(self.stale(self.cursor));
        }
        let mut pending = self.pending.clone();
        let mut terminal = self.terminal.clone();
        let Some(previous) = take_error(&mut pending, item.repo_id) else {
            return Err(self.stale(self.cursor));
        };

        let now = self.clock.now();
        let txn = conn
            .begin()
            .await
            .map_err(|err| map_db_err("begin retry commit", err))?;

        let mut success_count = self.success_count;
        match outcome {
            Ok(()) => {
                self.delete_error(&txn, &previous).await?;
                success_count += 1;
            }
            Err(failure) => {
                let (error, is_terminal) = self
                    .record_failure(&txn, Some(previous), item.repo_id, &failure, cfg)
                    .await?;
                if is_terminal {
                    terminal.push(error);
                } else {
                    pending.push(error);
                    pending.sort_by_key(|error| error.record_id);
                }
            }
        }

        let progress = Progress {
            success_count,
            runtime: self.runtime_duration + elapsed(item.opened_at, now),
            percent_complete: percent(success_count, self.total_count),
            started_at: self.started_at.or(Some(item.opened_at)),
            ..self.progress()
        };
        self.write_progress(&txn, &progress, None).await?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("commit retry", err))?;

        self.apply(progress);
        self.pending = pending;
        self.terminal = terminal;
        Ok(())
    }

    /// Reset the iteration in place: cursor, counts, timestamps and errors
    /// are cleared, the repository set and total count are kept.
    pub async fn restart<C: TransactionTrait>(&mut self, conn: &C) -> Result<(), BackfillError> {
        let txn = conn
            .begin()
            .await
            .map_err(|err| map_db_err("begin iterator restart", err))?;

        RepoIteratorErrorRecord::delete_many()
            .filter(repo_iterator_error::Column::RepoIteratorId.eq(self.id))
            .exec(&txn)
            .await
            .map_err(|err| map_db_err("clear repo iterator errors", err))?;

        let progress = Progress {
            cursor: 0,
            success_count: 0,
            started_at: None,
            completed_at: None,
            runtime: TimeDelta::zero(),
            percent_complete: 0.0,
        };
        self.write_progress(&txn, &progress, None).await?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("commit iterator restart", err))?;

        debug!(iterator_id = self.id, "Restarted repo iterator");
        self.apply(progress);
        self.pending.clear();
        self.terminal.clear();
        self.retried_this_pass.clear();
        Ok(())
    }

    /// Freeze the iteration: stamp completion, fix the runtime to the wall
    /// time since the first commit and pin progress to 100%.
    pub async fn mark_complete<C: TransactionTrait>(
        &mut self,
        conn: &C,
    ) -> Result<(), BackfillError> {
        let now = self.clock.now();
        let runtime = match self.started_at {
            Some(started_at) => elapsed(started_at, now),
            None => self.runtime_duration,
        };
        let progress = Progress {
            completed_at: Some(now),
            runtime,
            percent_complete: 1.0,
            ..self.progress()
        };

        let txn = conn
            .begin()
            .await
            .map_err(|err| map_db_err("begin iterator completion", err))?;
        self.write_progress(&txn, &progress, None).await?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit iterator completion", err))?;

        self.apply(progress);
        Ok(())
    }

    /// Whether unvisited repositories remain in the primary pass.
    pub fn has_more(&self) -> bool {
        (self.cursor.max(0) as usize) < self.repos.len()
    }

    /// Whether any repository holds an unresolved (retryable) error.
    pub fn has_errors(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Number of repositories that failed at least once, retryable or terminal.
    pub fn total_errors(&self) -> usize {
        self.pending.len() + self.terminal.len()
    }

    /// Every repository with a recorded failure, retryable ones first.
    pub fn errored_repos(&self) -> Vec<&IterationError> {
        self.pending.iter().chain(self.terminal.iter()).collect()
    }

    pub fn pending_errors(&self) -> &[IterationError] {
        &self.pending
    }

    pub fn terminal_errors(&self) -> &[IterationError] {
        &self.terminal
    }

    pub fn repo_ids(&self) -> &[i32] {
        &self.repos
    }

    async fn record_failure(
        &self,
        txn: &DatabaseTransaction,
        previous: Option<IterationError>,
        repo_id: i32,
        failure: &RepoFailure,
        cfg: &IterationConfig,
    ) -> Result<(IterationError, bool), BackfillError> {
        let (record_id, failure_count, mut messages) = match previous {
            Some(prev) => (Some(prev.record_id), prev.failure_count + 1, prev.messages),
            None => (None, 1, Vec::new()),
        };
        messages.push(failure.message.clone());
        let is_terminal = cfg.is_terminal(failure_count);

        let record_id = match record_id {
            Some(id) => {
                repo_iterator_error::ActiveModel {
                    id: Unchanged(id),
                    error_messages: Set(json!(messages)),
                    failure_count: Set(failure_count),
                    terminal: Set(is_terminal),
                    ..Default::default()
                }
                .update(txn)
                .await
                .map_err(|err| map_db_err("update repo iterator error", err))?;
                id
            }
            None => {
                repo_iterator_error::ActiveModel {
                    repo_iterator_id: Set(self.id),
                    repo_id: Set(repo_id),
                    error_messages: Set(json!(messages)),
                    failure_count: Set(failure_count),
                    terminal: Set(is_terminal),
                    ..Default::default()
                }
                .insert(txn)
                .await
                .map_err(|err| map_db_err("insert repo iterator error", err))?
                .id
            }
        };

        if is_terminal {
            warn!(
                iterator_id = self.id,
                repo_id,
                failure_count,
                error = %failure.message,
                "Repository reached failure limit"
            );
            counter!("insights_backfill_repo_terminal_failures_total").increment(1);
            if let Some(hook) = &cfg.on_terminal {
                hook.on_terminal(txn, repo_id, failure).await?;
            }
        }

        Ok((
            IterationError {
                repo_id,
                failure_count,
                messages,
                record_id,
            },
            is_terminal,
        ))
    }

    async fn delete_error(
        &self,
        txn: &DatabaseTransaction,
        error: &IterationError,
    ) -> Result<(), BackfillError> {
        RepoIteratorErrorRecord::delete_by_id(error.record_id)
            .exec(txn)
            .await
            .map_err(|err| map_db_err("delete repo iterator error", err))?;
        Ok(())
    }

    async fn write_progress(
        &self,
        txn: &DatabaseTransaction,
        progress: &Progress,
        expected_cursor: Option<i32>,
    ) -> Result<(), BackfillError> {
        let mut update = RepoIteratorRecord::update_many()
            .col_expr(repo_iterator::Column::RepoCursor, Expr::value(progress.cursor))
            .col_expr(
                repo_iterator::Column::SuccessCount,
                Expr::value(progress.success_count),
            )
            .col_expr(
                repo_iterator::Column::StartedAt,
                Expr::value(progress.started_at.map(|t| t.fixed_offset())),
            )
            .col_expr(
                repo_iterator::Column::CompletedAt,
                Expr::value(progress.completed_at.map(|t| t.fixed_offset())),
            )
            .col_expr(
                repo_iterator::Column::RuntimeDurationMs,
                Expr::value(progress.runtime.num_milliseconds()),
            )
            .col_expr(
                repo_iterator::Column::PercentComplete,
                Expr::value(progress.percent_complete),
            )
            .col_expr(
                repo_iterator::Column::LastUpdatedAt,
                Expr::value(self.clock.now_db()),
            )
            .filter(repo_iterator::Column::Id.eq(self.id));
        if let Some(cursor) = expected_cursor {
            update = update.filter(repo_iterator::Column::RepoCursor.eq(cursor));
        }

        let result = update
            .exec(txn)
            .await
            .map_err(|err| map_db_err("update repo iterator", err))?;

        if result.rows_affected == 0 {
            return Err(match expected_cursor {
                Some(cursor) => self.stale(cursor),
                None => BackfillError::NotFound {
                    entity: "repo iterator",
                    id: self.id,
                },
            });
        }
        Ok(())
    }

    fn progress(&self) -> Progress {
        Progress {
            cursor: self.cursor,
            success_count: self.success_count,
            started_at: self.started_at,
            completed_at: self.completed_at,
            runtime: self.runtime_duration,
            percent_complete: self.percent_complete,
        }
    }

    fn apply(&mut self, progress: Progress) {
        self.cursor = progress.cursor;
        self.success_count = progress.success_count;
        self.started_at = progress.started_at;
        self.completed_at = progress.completed_at;
        self.runtime_duration = progress.runtime;
        self.percent_complete = progress.percent_complete;
    }

    fn stale(&self, expected: i32) -> BackfillError {
        BackfillError::StaleIteration {
            iterator_id: self.id,
            cursor: self.cursor,
            expected,
        }
    }
}

fn take_error(errors: &mut Vec<IterationError>, repo_id: i32) -> Option<IterationError> {
    let index = errors.iter().position(|error| error.repo_id == repo_id)?;
    Some(errors.remove(index))
}

fn percent(success_count: i32, total_count: i32) -> f64 {
    if total_count <= 0 {
        return 0.0;
    }
    f64::from(success_count) / f64::from(total_count)
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> TimeDelta {
    (to - from).max(TimeDelta::zero())
}
