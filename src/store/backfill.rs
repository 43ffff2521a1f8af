//! # Backfill Store
//!
//! Durable record and state-transition API of a [`SeriesBackfill`].
//!
//! Every multi-row transition runs in its own transaction. When the caller
//! passes a transaction in, `begin` opens a savepoint, so these operations
//! compose inside the handlers' transactions and roll back with them.

use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait, Unchanged,
};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{BackfillError, map_db_err};
use crate::iterator::RepoIterator;
use crate::models::{
    BackfillState, RepoIteratorErrorRecord, Series, SeriesBackfill, SeriesBackfillEntity,
    repo_iterator_error, series_backfill,
};
use crate::queue;
use crate::store::SeriesStore;

/// Non-terminal states; the only backfills that compete for priority.
const ACTIVE_STATES: [BackfillState; 2] = [BackfillState::New, BackfillState::Processing];

/// A per-repository failure of a backfill, for display.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoErrorSummary {
    pub repo_id: i32,
    pub failure_count: i32,
    pub messages: Vec<String>,
    pub terminal: bool,
}

#[derive(Debug, Clone)]
pub struct BackfillStore {
    clock: Arc<dyn Clock>,
}

impl BackfillStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Create a backfill for `series` in state New, without an iterator.
    pub async fn new_backfill<C: ConnectionTrait>(
        &self,
        conn: &C,
        series: &Series,
    ) -> Result<SeriesBackfill, BackfillError> {
        let backfill = series_backfill::ActiveModel {
            series_id: Set(series.id),
            repo_iterator_id: Set(None),
            estimated_cost: Set(0.0),
            state: Set(BackfillState::New),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(|err| map_db_err("create series backfill", err))?;

        info!(backfill_id = backfill.id, series_id = series.id, "Created series backfill");
        Ok(backfill)
    }

    /// Attach an iterator over `repo_ids`, record `cost` and move to Processing.
    pub async fn set_scope<C: TransactionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
        repo_ids: &[i32],
        cost: f64,
    ) -> Result<SeriesBackfill, BackfillError> {
        if backfill.id == 0 {
            return Err(BackfillError::MissingIdentity);
        }

        let txn = begin(conn, "begin set scope").await?;
        let current = lock_backfill(&txn, backfill.id).await?;
        if current.repo_iterator_id.is_some() {
            return Err(BackfillError::ScopeAlreadyAssigned(backfill.id));
        }

        let iterator = RepoIterator::create(&txn, self.clock.clone(), repo_ids).await?;
        let updated = series_backfill::ActiveModel {
            id: Unchanged(backfill.id),
            repo_iterator_id: Set(Some(iterator.id)),
            estimated_cost: Set(cost),
            state: Set(BackfillState::Processing),
            ..Default::default()
        }
        .update(&txn)
        .await
        .map_err(|err| map_db_err("assign backfill scope", err))?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("commit set scope", err))?;

        info!(
            backfill_id = updated.id,
            iterator_id = iterator.id,
            repos = repo_ids.len(),
            cost,
            "Assigned backfill scope"
        );
        Ok(updated)
    }

    pub async fn set_completed<C: ConnectionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
    ) -> Result<SeriesBackfill, BackfillError> {
        self.set_terminal_state(conn, backfill, BackfillState::Completed)
            .await
    }

    pub async fn set_failed<C: ConnectionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
    ) -> Result<SeriesBackfill, BackfillError> {
        self.set_terminal_state(conn, backfill, BackfillState::Failed)
            .await
    }

    async fn set_terminal_state<C: ConnectionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
        state: BackfillState,
    ) -> Result<SeriesBackfill, BackfillError> {
        if backfill.repo_iterator_id.is_none() {
            return Err(BackfillError::MissingIterator(backfill.id));
        }
        let updated = series_backfill::ActiveModel {
            id: Unchanged(backfill.id),
            state: Set(state),
            ..Default::default()
        }
        .update(conn)
        .await
        .map_err(|err| map_db_err("set backfill state", err))?;

        info!(backfill_id = updated.id, state = %state, "Backfill reached terminal state");
        Ok(updated)
    }

    /// Push the backfill behind every other active backfill.
    pub async fn set_lowest_priority<C: TransactionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
    ) -> Result<SeriesBackfill, BackfillError> {
        let txn = begin(conn, "begin set lowest priority").await?;
        let current = lock_backfill(&txn, backfill.id).await?;
        let Some(max_cost) = other_active_cost(&txn, current.id, Extremum::Max).await? else {
            return Ok(current);
        };
        if current.estimated_cost > max_cost {
            return Ok(current);
        }

        let cost = if max_cost <= 0.0 { 1.0 } else { max_cost * 2.0 };
        let updated = write_cost(&txn, current.id, cost).await?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit set lowest priority", err))?;

        debug!(backfill_id = updated.id, cost, "Lowered backfill priority");
        Ok(updated)
    }

    /// Move the backfill in front of every other active backfill.
    pub async fn set_highest_priority<C: TransactionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
    ) -> Result<SeriesBackfill, BackfillError> {
        let txn = begin(conn, "begin set highest priority").await?;
        let current = lock_backfill(&txn, backfill.id).await?;
        let Some(min_cost) = other_active_cost(&txn, current.id, Extremum::Min).await? else {
            return Ok(current);
        };
        if current.estimated_cost < min_cost || current.estimated_cost == 0.0 {
            return Ok(current);
        }

        let updated = write_cost(&txn, current.id, 0.0).await?;
        txn.commit()
            .await
            .map_err(|err| map_db_err("commit set highest priority", err))?;

        debug!(backfill_id = updated.id, "Raised backfill priority");
        Ok(updated)
    }

    /// Re-drive a Failed backfill: restart its iterator in place, drop the
    /// series-wide error-limit markers of the failed attempt, move it back to
    /// Processing and enqueue it. Any other state is rejected untouched.
    pub async fn retry_backfill_attempt<C: TransactionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
    ) -> Result<SeriesBackfill, BackfillError> {
        let txn = begin(conn, "begin backfill retry").await?;
        let current = lock_backfill(&txn, backfill.id).await?;
        if current.state != BackfillState::Failed {
            return Err(BackfillError::InvalidState {
                backfill_id: current.id,
                expected: BackfillState::Failed,
                actual: current.state,
            });
        }
        let iterator_id = current
            .repo_iterator_id
            .ok_or(BackfillError::MissingIterator(current.id))?;

        let mut iterator = RepoIterator::load(&txn, self.clock.clone(), iterator_id).await?;
        iterator.restart(&txn).await?;
        SeriesStore::new(self.clock.clone())
            .clear_error_limit_markers(&txn, current.series_id)
            .await?;

        let updated = series_backfill::ActiveModel {
            id: Unchanged(current.id),
            state: Set(BackfillState::Processing),
            ..Default::default()
        }
        .update(&txn)
        .await
        .map_err(|err| map_db_err("reset backfill state", err))?;
        queue::insert_job(&txn, current.id, self.clock.now_db()).await?;

        txn.commit()
            .await
            .map_err(|err| map_db_err("commit backfill retry", err))?;

        info!(backfill_id = updated.id, "Retrying failed backfill");
        Ok(updated)
    }

    pub async fn load_backfill<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: i32,
    ) -> Result<SeriesBackfill, BackfillError> {
        SeriesBackfillEntity::find_by_id(id)
            .one(conn)
            .await
            .map_err(|err| map_db_err("load series backfill", err))?
            .ok_or(BackfillError::NotFound {
                entity: "series backfill",
                id,
            })
    }

    /// Every backfill of a series, oldest first.
    pub async fn load_series_backfills<C: ConnectionTrait>(
        &self,
        conn: &C,
        series_id: i32,
    ) -> Result<Vec<SeriesBackfill>, BackfillError> {
        SeriesBackfillEntity::find()
            .filter(series_backfill::Column::SeriesId.eq(series_id))
            .order_by_asc(series_backfill::Column::Id)
            .all(conn)
            .await
            .map_err(|err| map_db_err("load series backfills", err))
    }

    /// Load the iterator attached to a scoped backfill.
    pub async fn load_iterator<C: ConnectionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
    ) -> Result<RepoIterator, BackfillError> {
        let iterator_id = backfill
            .repo_iterator_id
            .ok_or(BackfillError::MissingIterator(backfill.id))?;
        RepoIterator::load(conn, self.clock.clone(), iterator_id).await
    }

    /// Up to `limit` recorded repository failures of a backfill, oldest first.
    pub async fn load_backfill_errors<C: ConnectionTrait>(
        &self,
        conn: &C,
        backfill: &SeriesBackfill,
        limit: u64,
    ) -> Result<Vec<RepoErrorSummary>, BackfillError> {
        let Some(iterator_id) = backfill.repo_iterator_id else {
            return Ok(Vec::new());
        };

        let rows = RepoIteratorErrorRecord::find()
            .filter(repo_iterator_error::Column::RepoIteratorId.eq(iterator_id))
            .order_by_asc(repo_iterator_error::Column::Id)
            .limit(limit)
            .all(conn)
            .await
            .map_err(|err| map_db_err("load backfill errors", err))?;

        rows.into_iter()
            .map(|row| {
                let messages = serde_json::from_value(row.error_messages).map_err(|source| {
                    BackfillError::CorruptIterator {
                        iterator_id,
                        source,
                    }
                })?;
                Ok(RepoErrorSummary {
                    repo_id: row.repo_id,
                    failure_count: row.failure_count,
                    messages,
                    terminal: row.terminal,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Extremum {
    Max,
    Min,
}

async fn begin<C: TransactionTrait>(
    conn: &C,
    context: &'static str,
) -> Result<DatabaseTransaction, BackfillError> {
    conn.begin().await.map_err(|err| map_db_err(context, err))
}

async fn lock_backfill(
    txn: &DatabaseTransaction,
    id: i32,
) -> Result<SeriesBackfill, BackfillError> {
    SeriesBackfillEntity::find_by_id(id)
        .lock_exclusive()
        .one(txn)
        .await
        .map_err(|err| map_db_err("lock series backfill", err))?
        .ok_or(BackfillError::NotFound {
            entity: "series backfill",
            id,
        })
}

/// Max or min cost among the other active backfills, `None` when there are none.
async fn other_active_cost(
    txn: &DatabaseTransaction,
    exclude_id: i32,
    extremum: Extremum,
) -> Result<Option<f64>, BackfillError> {
    let aggregate = match extremum {
        Extremum::Max => series_backfill::Column::EstimatedCost.max(),
        Extremum::Min => series_backfill::Column::EstimatedCost.min(),
    };

    let value = SeriesBackfillEntity::find()
        .select_only()
        .column_as(aggregate, "cost")
        .filter(series_backfill::Column::Id.ne(exclude_id))
        .filter(series_backfill::Column::State.is_in(ACTIVE_STATES))
        .into_tuple::<Option<f64>>()
        .one(txn)
        .await
        .map_err(|err| map_db_err("read backfill cost extremum", err))?;

    Ok(value.flatten())
}

async fn write_cost(
    txn: &DatabaseTransaction,
    id: i32,
    cost: f64,
) -> Result<SeriesBackfill, BackfillError> {
    SeriesBackfillEntity::update_many()
        .col_expr(series_backfill::Column::EstimatedCost, Expr::value(cost))
        .filter(series_backfill::Column::Id.eq(id))
        .exec(txn)
        .await
        .map_err(|err| map_db_err("update backfill cost", err))?;
    SeriesBackfillEntity::find_by_id(id)
        .one(txn)
        .await
        .map_err(|err| map_db_err("reload series backfill", err))?
        .ok_or(BackfillError::NotFound {
            entity: "series backfill",
            id,
        })
}
