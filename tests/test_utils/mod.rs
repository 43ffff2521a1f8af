//! Test utilities for database testing.
//!
//! In-memory SQLite with every migration applied, series fixtures and
//! scriptable stand-ins for the collaborators the handlers call.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use insights_backfiller::clock::{Clock, MockClock};
use insights_backfiller::collaborators::{
    BackfillRequest, BackfillRunner, CostAnalyzer, QueryObject, RepoLookupError, RepoRef,
    RepoResolver, Repo, RunError, ScopeResolver,
};
use insights_backfiller::config::BackfillConfig;
use insights_backfiller::models::{IntervalUnit, Series};
use insights_backfiller::store::{NewSeries, SeriesStore};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(Arc::new(db))
}

/// Fixed instant every test clock starts from.
pub fn test_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 30).unwrap()
}

pub fn mock_clock() -> (MockClock, Arc<dyn Clock>) {
    let clock = MockClock::new(test_start());
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    (clock, shared)
}

/// Creates a monthly series covering every repository.
pub async fn create_series(
    db: &DatabaseConnection,
    clock: Arc<dyn Clock>,
    series_id: &str,
) -> Result<Series> {
    let series = SeriesStore::new(clock)
        .create_series(
            db,
            NewSeries {
                series_id: series_id.to_string(),
                query: "patterntype:regexp fmt\\.Errorf".to_string(),
                interval_unit: IntervalUnit::Month,
                interval_value: 1,
                repositories: None,
            },
        )
        .await?;
    Ok(series)
}

/// Backfill settings sized for tests: one repository at a time, a small
/// error floor and a generous time budget.
pub fn backfill_config() -> BackfillConfig {
    BackfillConfig {
        page_size: 2,
        repo_concurrency: 1,
        interrupt_after_seconds: 3_600,
        max_failures: 3,
        error_threshold_floor: 50,
        error_percent: 0.05,
        sample_count: 12,
    }
}

pub fn repo_refs(ids: &[i32]) -> Vec<RepoRef> {
    ids.iter()
        .map(|id| RepoRef {
            id: *id,
            name: format!("github.com/acme/repo-{id}"),
        })
        .collect()
}

/// Resolves every series to a fixed repository list.
pub struct StaticScope(pub Vec<RepoRef>);

#[async_trait]
impl ScopeResolver for StaticScope {
    async fn repositories(&self, _series: &Series) -> anyhow::Result<Vec<RepoRef>> {
        Ok(self.0.clone())
    }
}

pub struct FailingScope;

#[async_trait]
impl ScopeResolver for FailingScope {
    async fn repositories(&self, _series: &Series) -> anyhow::Result<Vec<RepoRef>> {
        anyhow::bail!("search backend unavailable")
    }
}

pub struct FixedCost(pub f64);

impl CostAnalyzer for FixedCost {
    fn cost(&self, _query: &QueryObject) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

/// Resolves every repository except the ones listed as missing.
#[derive(Default)]
pub struct Repos {
    pub missing: HashSet<i32>,
}

impl Repos {
    pub fn without(missing: &[i32]) -> Self {
        Self {
            missing: missing.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl RepoResolver for Repos {
    async fn get(&self, repo_id: i32) -> Result<Repo, RepoLookupError> {
        if self.missing.contains(&repo_id) {
            return Err(RepoLookupError::NotFound(repo_id));
        }
        Ok(Repo {
            id: repo_id,
            name: format!("github.com/acme/repo-{repo_id}"),
        })
    }
}

/// Records every run, fails the configured repositories and optionally
/// advances a mock clock per run to simulate slow searches.
#[derive(Default)]
pub struct ScriptedRunner {
    pub calls: Mutex<Vec<i32>>,
    pub failing: HashSet<i32>,
    pub timing_out: HashSet<i32>,
    pub fail_all: bool,
    pub tick: Option<(MockClock, chrono::Duration)>,
}

impl ScriptedRunner {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing(repo_ids: &[i32]) -> Self {
        Self {
            failing: repo_ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn timing_out(repo_ids: &[i32]) -> Self {
        Self {
            timing_out: repo_ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    pub fn with_tick(mut self, clock: MockClock, per_run: chrono::Duration) -> Self {
        self.tick = Some((clock, per_run));
        self
    }

    pub fn calls(&self) -> Vec<i32> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackfillRunner for ScriptedRunner {
    async fn run(&self, request: BackfillRequest) -> Result<(), RunError> {
        let repo_id = request.repo.id;
        self.calls.lock().unwrap().push(repo_id);
        if let Some((clock, per_run)) = &self.tick {
            clock.advance(*per_run);
        }
        if self.timing_out.contains(&repo_id) {
            return Err(RunError::Timeout(format!("search for repo {repo_id} timed out")));
        }
        if self.fail_all || self.failing.contains(&repo_id) {
            return Err(RunError::Failed(anyhow::anyhow!(
                "search for repo {repo_id} failed"
            )));
        }
        Ok(())
    }
}

/// Succeeds after a short sleep while tracking how many runs overlap.
pub struct GaugeRunner {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    runs: AtomicUsize,
    hold: Duration,
}

impl GaugeRunner {
    pub fn new(hold: Duration) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            hold,
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackfillRunner for GaugeRunner {
    async fn run(&self, _request: BackfillRequest) -> Result<(), RunError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
