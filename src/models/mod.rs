//! # Data Models
//!
//! SeaORM entities for the tables owned by the backfiller, plus the enums
//! stored in their state and reason columns.

pub mod background_job;
pub mod incomplete_point;
pub mod insight_series;
pub mod recording_time;
pub mod repo_iterator;
pub mod repo_iterator_error;
pub mod series_backfill;

pub use background_job::{Entity as BackgroundJob, JobState};
pub use incomplete_point::{Entity as IncompletePoint, IncompleteReason};
pub use insight_series::{Entity as InsightSeries, IntervalUnit};
pub use recording_time::Entity as RecordingTime;
pub use repo_iterator::Entity as RepoIteratorRecord;
pub use repo_iterator_error::Entity as RepoIteratorErrorRecord;
pub use series_backfill::{BackfillState, Entity as SeriesBackfillEntity};

/// A persisted backfill record.
pub type SeriesBackfill = series_backfill::Model;

/// A persisted insight series definition.
pub type Series = insight_series::Model;
