//! Interfaces of the services the backfill handlers call out to.
//!
//! Repository discovery, per-repository historical sampling and repository
//! metadata live outside this crate. Handlers only see these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::Series;

/// A repository in the scope of a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub id: i32,
    pub name: String,
}

/// Resolves the repositories a series covers.
#[async_trait]
pub trait ScopeResolver: Send + Sync {
    async fn repositories(&self, series: &Series) -> anyhow::Result<Vec<RepoRef>>;
}

/// Input of the cost analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryObject {
    pub query: String,
    pub repo_count: usize,
}

/// Scores the expense of backfilling a query over a number of repositories.
pub trait CostAnalyzer: Send + Sync {
    fn cost(&self, query: &QueryObject) -> anyhow::Result<f64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repo {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum RepoLookupError {
    /// The repository was deleted or is no longer visible.
    #[error("repository {0} not found")]
    NotFound(i32),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Looks up repository metadata by id.
#[async_trait]
pub trait RepoResolver: Send + Sync {
    async fn get(&self, repo_id: i32) -> Result<Repo, RepoLookupError>;
}

/// One repository's share of a backfill.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub series: Series,
    pub repo: Repo,
    pub sample_times: Vec<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum RunError {
    /// The search for this repository ran out of time.
    #[error("backfill timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Computes the historical points of one repository for a series.
///
/// Calls must be idempotent: a repository may be run again after a crash or
/// a retry and is expected to produce the same points.
#[async_trait]
pub trait BackfillRunner: Send + Sync {
    async fn run(&self, request: BackfillRequest) -> Result<(), RunError>;
}
