//! Engine settings read from `FOOD_RESCUE_*` environment variables
use anyhow::Context;
use chrono::TimeDelta;
use std::{env, fmt::Display, path::PathBuf, str::FromStr};
use tracing::info;

/// Upper bound on the reservation hold, one day.
pub const MAX_RESERVATION_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    /// How long an NGO's reservation holds a listing before others may claim it.
    pub reservation_window: TimeDelta,
    pub activity_feed_limit: usize,
    pub cancelled_report_days: i64,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("food_rescue.db"),
            reservation_window: TimeDelta::minutes(10),
            activity_feed_limit: 50,
            cancelled_report_days: 7,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// Loads from an arbitrary lookup, e.g. a map in tests.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let reservation_minutes: i64 = try_load(
            &lookup,
            "FOOD_RESCUE_RESERVATION_MINUTES",
            defaults.reservation_window.num_minutes(),
        )?;
        if !(1..=MAX_RESERVATION_MINUTES).contains(&reservation_minutes) {
            anyhow::bail!(
                "FOOD_RESCUE_RESERVATION_MINUTES must be between 1 and {MAX_RESERVATION_MINUTES}, got {reservation_minutes}"
            );
        }
        let reservation_window = TimeDelta::try_minutes(reservation_minutes)
            .context("FOOD_RESCUE_RESERVATION_MINUTES is out of range")?;
        let cancelled_report_days: i64 = try_load(
            &lookup,
            "FOOD_RESCUE_CANCELLED_REPORT_DAYS",
            defaults.cancelled_report_days,
        )?;
        if cancelled_report_days < 0 {
            anyhow::bail!("FOOD_RESCUE_CANCELLED_REPORT_DAYS must not be negative");
        }

        Ok(Self {
            db_path: try_load(&lookup, "FOOD_RESCUE_DB_PATH", defaults.db_path.display())?,
            reservation_window,
            activity_feed_limit: try_load(
                &lookup,
                "FOOD_RESCUE_ACTIVITY_LIMIT",
                defaults.activity_feed_limit,
            )?,
            cancelled_report_days,
            log_level: try_load(&lookup, "FOOD_RESCUE_LOG", defaults.log_level)?,
        })
    }
}

/// Log level from `FOOD_RESCUE_LOG`, read on its own so the subscriber can be
/// up before the rest of the config is loaded and logged.
pub fn log_level_with(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("FOOD_RESCUE_LOG")
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| EngineConfig::default().log_level)
}

/// `EnvFilter` directive: the crate at `log_level`, dependencies at warn.
pub fn filter_directive(log_level: &str) -> String {
    format!("food_rescue={log_level},warn")
}

fn try_load<T, D>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: D) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
    D: Display,
{
    let raw = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("invalid {key} value '{raw}'"))
}
