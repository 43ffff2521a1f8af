//! Telemetry: the global tracing subscriber and the span every dequeued job
//! runs under.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tracing::{Span, info_span};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Default filter when `RUST_LOG` is unset. Per-statement sqlx logging stays at
/// warn unless asked for explicitly.
fn default_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::new(format!("{},sqlx::query=warn", config.log_level))
}

/// Install the global subscriber once per process and bridge `log` records
/// (sea-orm, sqlx) into it. Later calls are no-ops.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        // Another component may already have bridged `log`.
        if !type_name_of_val(log::logger()).contains("LogTracer") {
            TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config));
    let fmt_layer = if config.log_format == "pretty" {
        fmt::layer().pretty().with_target(true).boxed()
    } else {
        fmt::layer().json().with_current_span(true).boxed()
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!("Warning: tracing subscriber already installed, keeping it: {err}");
    }

    Ok(())
}

/// Span wrapping one handler invocation for a dequeued job.
pub fn job_span(queue: &'static str, job_id: i32, backfill_id: i32) -> Span {
    info_span!("backfill_job", queue, job_id, backfill_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = AppConfig {
            log_format: "pretty".to_string(),
            ..AppConfig::default()
        };
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }
}
