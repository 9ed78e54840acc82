//! Runs one expiry reconciliation sweep against the configured database.
use anyhow::Context;
use food_rescue::{
    config::{self, EngineConfig},
    query::ListingQuery,
    service::LifecycleService,
};
use std::{env, sync::Arc};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    init_tracing(&config::log_level_with(|key| env::var(key).ok()));
    let config = EngineConfig::load()?;
    tracing::info!(
        db_path = %config.db_path.display(),
        reservation_window = %config.reservation_window,
        activity_feed_limit = config.activity_feed_limit,
        cancelled_report_days = config.cancelled_report_days,
        log_level = %config.log_level,
        "engine config loaded"
    );

    let db = sled::open(&config.db_path)
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    let db = Arc::new(db);

    let service = LifecycleService::open_sled(db.clone(), config.clone())?;
    let report = service.sweep_expired().context("expiry sweep failed")?;

    for id in &report.expired {
        tracing::info!(listing_id = %id, "expired");
    }
    for (id, error) in &report.failed {
        tracing::warn!(listing_id = %id, %error, "expiry failed");
    }

    let query = ListingQuery::open_sled(db.clone())?;
    for (status, count) in query.status_counts()? {
        tracing::info!(%status, count, "listing status");
    }
    let cancelled = query.cancelled_within(config.cancelled_report_days)?;
    tracing::info!(
        days = config.cancelled_report_days,
        cancelled = cancelled.len(),
        "recent cancellations"
    );
    for activity in query.recent_activity(config.activity_feed_limit)? {
        tracing::debug!(
            action = %activity.record.action,
            target = %activity.record.target_id,
            at = %activity.record.timestamp,
            "{}",
            activity.record.details
        );
    }

    db.flush()?;
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::filter_directive(log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
