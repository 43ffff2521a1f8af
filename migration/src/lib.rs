//! Database migrations for the insights backfiller.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_090000_create_insight_series;
mod m2025_11_10_090100_create_repo_iterators;
mod m2025_11_10_090200_create_series_backfill;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_090000_create_insight_series::Migration),
            Box::new(m2025_11_10_090100_create_repo_iterators::Migration),
            Box::new(m2025_11_10_090200_create_series_backfill::Migration),
        ]
    }
}
