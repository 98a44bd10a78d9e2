//! SQLite persistence (via sqlx): a typed key/value table for configuration
//! records plus an append-only watering-event history.  Values are JSON
//! documents; a size/shape change in a record type is a new schema version
//! carried inside the document itself.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Key schema
// ---------------------------------------------------------------------------

/// One key per logical record.
pub mod keys {
    pub const SYSTEM: &str = "system";
    pub const CALIBRATION: &str = "calibration";
    pub const DAYS_SINCE_START: &str = "days_since_start";
    pub const WIPE_PROGRESS: &str = "wipe_progress";
    pub const ONBOARDING: &str = "onboarding";
    pub const RAIN_HISTORY: &str = "rain_history";
    pub const ENV_HISTORY: &str = "env_history";

    pub fn channel(index: usize) -> String {
        format!("channel.{index}")
    }

    pub fn channel_runtime(index: usize) -> String {
        format!("channel_rt.{index}")
    }
}

// ---------------------------------------------------------------------------
// History rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WateringEvent {
    pub ts_start: i64,
    pub ts_end: i64,
    pub channel: u8,
    /// "manual" / "scheduled" / "rain_adjusted" / "auto" etc.
    pub trigger: String,
    /// "start" / "complete" / "abort:<reason>".
    pub result: String,
    pub effective_secs: i64,
    pub delivered_ml: i64,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// db_url examples:
    /// - "sqlite:/var/lib/controller/controller.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn open(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
              key   TEXT PRIMARY KEY NOT NULL,
              value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create kv table failed")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS watering_events (
              id             INTEGER PRIMARY KEY AUTOINCREMENT,
              ts_start       INTEGER NOT NULL,
              ts_end         INTEGER NOT NULL,
              channel        INTEGER NOT NULL,
              cause          TEXT NOT NULL,
              result         TEXT NOT NULL,
              effective_secs INTEGER NOT NULL,
              delivered_ml   INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create watering_events table failed")?;

        Ok(())
    }

    // ----------------------------
    // Typed key/value
    // ----------------------------

    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).context("serialize record failed")?;
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("save '{key}' failed"))?;
        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("load '{key}' failed"))?;

        match row {
            Some(row) => {
                let json: String = row.get(0);
                let value = serde_json::from_str(&json)
                    .with_context(|| format!("deserialize '{key}' failed"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete '{key}' failed"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("exists '{key}' failed"))?;
        Ok(row.is_some())
    }

    /// All stored keys, for the wipe verify step.
    pub async fn all_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM kv ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .context("all_keys failed")?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    // ----------------------------
    // Watering-event history
    // ----------------------------

    pub async fn append_watering_event(&self, ev: &WateringEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events
              (ts_start, ts_end, channel, cause, result, effective_secs, delivered_ml)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ev.ts_start)
        .bind(ev.ts_end)
        .bind(ev.channel as i64)
        .bind(&ev.trigger)
        .bind(&ev.result)
        .bind(ev.effective_secs)
        .bind(ev.delivered_ml)
        .execute(&self.pool)
        .await
        .context("append_watering_event failed")?;
        Ok(())
    }

    /// Most recent events first.  `offset` supports the entry-indexed
    /// History record reads.
    pub async fn watering_events(&self, offset: i64, limit: i64) -> Result<Vec<WateringEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT ts_start, ts_end, channel, cause, result, effective_secs, delivered_ml
            FROM watering_events
            ORDER BY id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("watering_events failed")?;

        Ok(rows
            .into_iter()
            .map(|r| WateringEvent {
                ts_start: r.get(0),
                ts_end: r.get(1),
                channel: r.get::<i64, _>(2) as u8,
                trigger: r.get(3),
                result: r.get(4),
                effective_secs: r.get(5),
                delivered_ml: r.get(6),
            })
            .collect())
    }

    pub async fn clear_watering_events(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM watering_events")
            .execute(&self.pool)
            .await
            .context("clear_watering_events failed")?;
        Ok(result.rows_affected())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
