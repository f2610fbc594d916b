//! Metrics Store: per-day counters backed by embedded SQLite —
//! valve-open seconds, integrated water volume, mode-transition counts, and
//! fault counts, one row per `(date, mode_index)`. Single writer via one
//! pooled connection; retention and vacuum run on a daily tick.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use time::{Date, OffsetDateTime, UtcOffset};

use crate::error::CoolerError;

const RETENTION_DAYS: i64 = 400;
const SCHEMA_VERSION: i64 = 1;

/// One day's rollup for one mode index.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyMetric {
    pub date: Date,
    pub mode_index: u16,
    pub open_sec: i64,
    pub volume_l: f64,
    pub fault_count: i64,
}

pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    pub async fn connect(db_path: &str) -> Result<Self, CoolerError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| CoolerError::transient_io(format!("metrics db connect: {e}")))?;

        ensure_incremental_auto_vacuum(&pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("metrics migrate: {e}")))?;

        let existing: Option<i64> = sqlx::query("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&pool)
            .await
            .map_err(|e| CoolerError::transient_io(format!("metrics read version: {e}")))?
            .map(|row| row.get(0));

        if existing.is_none() {
            sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
                .bind(SCHEMA_VERSION)
                .execute(&pool)
                .await
                .map_err(|e| CoolerError::transient_io(format!("metrics seed version: {e}")))?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS metrics_daily (
                date TEXT NOT NULL,
                mode_index INTEGER NOT NULL,
                open_sec INTEGER NOT NULL DEFAULT 0,
                volume_l REAL NOT NULL DEFAULT 0,
                fault_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date, mode_index)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("metrics migrate: {e}")))?;

        Ok(Self { pool })
    }

    /// Today's local-time date key, per the resolved day-rollover decision
    /// (local midnight, not UTC).
    pub fn today_local() -> Date {
        let offset = UtcOffset::local_offset_at(OffsetDateTime::now_utc()).unwrap_or(UtcOffset::UTC);
        OffsetDateTime::now_utc().to_offset(offset).date()
    }

    pub async fn add_open_seconds(&self, date: Date, mode_index: u16, sec: i64) -> Result<(), CoolerError> {
        self.ensure_row(date, mode_index).await?;
        sqlx::query(
            "UPDATE metrics_daily SET open_sec = open_sec + ?1 WHERE date = ?2 AND mode_index = ?3",
        )
        .bind(sec)
        .bind(date_str(date))
        .bind(mode_index)
        .execute(&self.pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("metrics add_open_seconds: {e}")))?;
        Ok(())
    }

    pub async fn add_volume(&self, date: Date, mode_index: u16, liters: f64) -> Result<(), CoolerError> {
        self.ensure_row(date, mode_index).await?;
        sqlx::query(
            "UPDATE metrics_daily SET volume_l = volume_l + ?1 WHERE date = ?2 AND mode_index = ?3",
        )
        .bind(liters)
        .bind(date_str(date))
        .bind(mode_index)
        .execute(&self.pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("metrics add_volume: {e}")))?;
        Ok(())
    }

    pub async fn add_fault(&self, date: Date, mode_index: u16) -> Result<(), CoolerError> {
        self.ensure_row(date, mode_index).await?;
        sqlx::query(
            "UPDATE metrics_daily SET fault_count = fault_count + 1 WHERE date = ?1 AND mode_index = ?2",
        )
        .bind(date_str(date))
        .bind(mode_index)
        .execute(&self.pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("metrics add_fault: {e}")))?;
        Ok(())
    }

    async fn ensure_row(&self, date: Date, mode_index: u16) -> Result<(), CoolerError> {
        sqlx::query(
            "INSERT OR IGNORE INTO metrics_daily (date, mode_index) VALUES (?1, ?2)",
        )
        .bind(date_str(date))
        .bind(mode_index)
        .execute(&self.pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("metrics ensure_row: {e}")))?;
        Ok(())
    }

    /// Today plus the prior `days - 1` days' integrated volume, newest
    /// first — feeds the webui's `/api/watering` histogram.
    pub async fn recent_volume(&self, days: i64) -> Result<Vec<(Date, f64)>, CoolerError> {
        let today = Self::today_local();
        let cutoff = today - time::Duration::days(days - 1);

        let rows = sqlx::query(
            "SELECT date, SUM(volume_l) as total FROM metrics_daily WHERE date >= ?1 GROUP BY date ORDER BY date DESC",
        )
        .bind(date_str(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("metrics recent_volume: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let date_str: String = row.try_get("date").map_err(|e| CoolerError::transient_io(e.to_string()))?;
                let date = parse_date(&date_str)?;
                let total: f64 = row.try_get("total").map_err(|e| CoolerError::transient_io(e.to_string()))?;
                Ok((date, total))
            })
            .collect()
    }

    /// Delete rollups older than the retention window.
    pub async fn prune(&self) -> Result<u64, CoolerError> {
        let cutoff = Self::today_local() - time::Duration::days(RETENTION_DAYS);
        let result = sqlx::query("DELETE FROM metrics_daily WHERE date < ?1")
            .bind(date_str(cutoff))
            .execute(&self.pool)
            .await
            .map_err(|e| CoolerError::transient_io(format!("metrics prune: {e}")))?;

        sqlx::query("PRAGMA incremental_vacuum")
            .execute(&self.pool)
            .await
            .map_err(|e| CoolerError::transient_io(format!("metrics vacuum: {e}")))?;

        Ok(result.rows_affected())
    }

    /// Atomic file-level backup via `VACUUM INTO` into a temp file, renamed
    /// into place on success — avoids ever leaving a half-written backup on
    /// an SD-card deployment that loses power mid-copy.
    pub async fn backup(&self, dest_path: &str) -> Result<(), CoolerError> {
        let tmp_path = format!("{dest_path}.tmp");
        sqlx::query(&format!("VACUUM INTO '{tmp_path}'"))
            .execute(&self.pool)
            .await
            .map_err(|e| CoolerError::transient_io(format!("metrics backup: {e}")))?;
        std::fs::rename(&tmp_path, dest_path)
            .map_err(|e| CoolerError::transient_io(format!("metrics backup rename: {e}")))?;
        Ok(())
    }
}

/// Ensures the database uses `auto_vacuum = INCREMENTAL`, which is required
/// for `PRAGMA incremental_vacuum` (used by `prune`) to actually reclaim
/// freed pages. A fresh file takes the PRAGMA immediately; an existing file
/// created under the default `auto_vacuum = NONE` needs a one-time `VACUUM`
/// to restructure. Both must run outside a transaction, so this runs before
/// `CREATE TABLE` rather than as a migration.
async fn ensure_incremental_auto_vacuum(pool: &SqlitePool) -> Result<(), CoolerError> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| CoolerError::transient_io(format!("acquire connection for auto_vacuum setup: {e}")))?;

    let row = sqlx::query("PRAGMA auto_vacuum")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| CoolerError::transient_io(format!("query auto_vacuum mode: {e}")))?;
    let current: i32 = row.try_get(0).map_err(|e| CoolerError::transient_io(e.to_string()))?;

    if current != 2 {
        // 0 = NONE (default), 1 = FULL, 2 = INCREMENTAL
        tracing::info!(current, "converting metrics db to auto_vacuum=INCREMENTAL (one-time VACUUM)");
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
            .execute(&mut *conn)
            .await
            .map_err(|e| CoolerError::transient_io(format!("set auto_vacuum = INCREMENTAL: {e}")))?;
        sqlx::query("VACUUM")
            .execute(&mut *conn)
            .await
            .map_err(|e| CoolerError::transient_io(format!("vacuum after setting auto_vacuum: {e}")))?;
    }

    Ok(())
}

fn date_str(date: Date) -> String {
    date.format(&time::format_description::well_known::Iso8601::DATE)
        .expect("ISO8601 date formatting cannot fail for a valid Date")
}

fn parse_date(s: &str) -> Result<Date, CoolerError> {
    Date::parse(s, &time::format_description::well_known::Iso8601::DATE)
        .map_err(|e| CoolerError::transient_io(format!("parse date: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> MetricsStore {
        MetricsStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn add_open_seconds_accumulates() {
        let store = memory_store().await;
        let date = MetricsStore::today_local();
        store.add_open_seconds(date, 1, 60).await.unwrap();
        store.add_open_seconds(date, 1, 30).await.unwrap();

        let rows = store.recent_volume(1).await.unwrap();
        // recent_volume reports volume, not open_sec; just confirm the row
        // exists with zero volume since none was added yet.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, 0.0);
    }

    #[tokio::test]
    async fn add_volume_accumulates_and_is_queryable() {
        let store = memory_store().await;
        let date = MetricsStore::today_local();
        store.add_volume(date, 1, 2.5).await.unwrap();
        store.add_volume(date, 2, 1.0).await.unwrap();

        let rows = store.recent_volume(1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].1 - 3.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recent_volume_only_includes_cutoff_window() {
        let store = memory_store().await;
        let today = MetricsStore::today_local();
        let old = today - time::Duration::days(20);
        store.add_volume(today, 1, 1.0).await.unwrap();
        store.add_volume(old, 1, 99.0).await.unwrap();

        let rows = store.recent_volume(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, today);
    }

    #[tokio::test]
    async fn prune_removes_rows_older_than_retention() {
        let store = memory_store().await;
        let today = MetricsStore::today_local();
        let ancient = today - time::Duration::days(RETENTION_DAYS + 10);
        store.add_volume(ancient, 1, 1.0).await.unwrap();
        store.add_volume(today, 1, 1.0).await.unwrap();

        let removed = store.prune().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn add_fault_increments_counter() {
        let store = memory_store().await;
        let date = MetricsStore::today_local();
        store.add_fault(date, 1).await.unwrap();
        store.add_fault(date, 1).await.unwrap();

        let row = sqlx::query("SELECT fault_count FROM metrics_daily WHERE date = ?1 AND mode_index = 1")
            .bind(date_str(date))
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let count: i64 = row.get(0);
        assert_eq!(count, 2);
    }
}
