//! Event Log: append-only event stream backed by an in-process ring
//! plus a SQLite table, with SSE fan-out for connected UI clients. Reads
//! fall through ring first, table second, so recent history never touches
//! disk while older records stay available.

use std::collections::VecDeque;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;
use tokio::sync::{broadcast, RwLock};

use crate::error::CoolerError;
use crate::model::{EventKind, EventLevel, EventRecord};

/// Notification pushed to SSE subscribers on every append. The UI re-fetches
/// via the REST API rather than receiving the full record over SSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseNotice {
    Log,
    Stat,
}

pub struct EventLog {
    pool: SqlitePool,
    ring: RwLock<VecDeque<EventRecord>>,
    ring_size: usize,
    sse_tx: broadcast::Sender<SseNotice>,
}

impl EventLog {
    pub async fn connect(db_path: &str, ring_size: usize, sse_queue_max: usize) -> Result<Arc<Self>, CoolerError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| CoolerError::transient_io(format!("event log db connect: {e}")))?;

        ensure_incremental_auto_vacuum(&pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                level TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("event log migrate: {e}")))?;

        let (sse_tx, _) = broadcast::channel(sse_queue_max);

        Ok(Arc::new(Self {
            pool,
            ring: RwLock::new(VecDeque::with_capacity(ring_size)),
            ring_size,
            sse_tx,
        }))
    }

    /// Append a new event, assigning `id`/`ts`, persisting it, updating the
    /// in-memory ring, and notifying any connected SSE clients.
    pub async fn append(
        &self,
        level: EventLevel,
        kind: EventKind,
        message: impl Into<String>,
    ) -> Result<EventRecord, CoolerError> {
        let ts = OffsetDateTime::now_utc();
        let message = message.into();

        let level_str = level_str(level);
        let kind_str = kind_str(kind);
        let ts_str = ts
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| CoolerError::transient_io(format!("format ts: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO events (ts, level, kind, message) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&ts_str)
        .bind(level_str)
        .bind(kind_str)
        .bind(&message)
        .execute(&self.pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("event log insert: {e}")))?;

        let record = EventRecord {
            id: result.last_insert_rowid(),
            ts,
            level,
            kind,
            message,
        };

        {
            let mut ring = self.ring.write().await;
            if ring.len() == self.ring_size {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        // A slow SSE receiver just lags and eventually drops messages; that
        // is the intended backpressure behavior, not an error here.
        let _ = self.sse_tx.send(SseNotice::Log);

        Ok(record)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SseNotice> {
        self.sse_tx.subscribe()
    }

    /// Paged read, newest first. Falls through ring → table transparently:
    /// if the ring satisfies the page it is used directly, otherwise the
    /// table is queried.
    pub async fn read_page(&self, offset: usize, limit: usize) -> Result<Vec<EventRecord>, CoolerError> {
        let ring = self.ring.read().await;
        // The ring alone can satisfy the page either because nothing has
        // been evicted yet (it holds every record that exists) or because
        // it already has enough entries to cover `offset..offset+limit`.
        let ring_has_everything = ring.len() < self.ring_size;
        if ring_has_everything || ring.len() >= offset + limit {
            let newest_first: Vec<EventRecord> = ring.iter().rev().cloned().collect();
            drop(ring);
            return Ok(newest_first.into_iter().skip(offset).take(limit).collect());
        }
        drop(ring);

        let rows = sqlx::query(
            "SELECT id, ts, level, kind, message FROM events ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoolerError::transient_io(format!("event log read: {e}")))?;

        rows.into_iter()
            .map(|row| row_to_record(&row))
            .collect::<Result<Vec<_>, _>>()
    }

    /// Delete table rows older than `retention_days` and reclaim space.
    pub async fn prune(&self, retention_days: i64) -> Result<u64, CoolerError> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(retention_days);
        let cutoff_str = cutoff
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| CoolerError::transient_io(format!("format cutoff: {e}")))?;

        let result = sqlx::query("DELETE FROM events WHERE ts < ?1")
            .bind(&cutoff_str)
            .execute(&self.pool)
            .await
            .map_err(|e| CoolerError::transient_io(format!("event log prune: {e}")))?;

        sqlx::query("PRAGMA incremental_vacuum")
            .execute(&self.pool)
            .await
            .map_err(|e| CoolerError::transient_io(format!("event log vacuum: {e}")))?;

        Ok(result.rows_affected())
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
        tracing::info!(current, "converting event log db to auto_vacuum=INCREMENTAL (one-time VACUUM)");
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

fn level_str(level: EventLevel) -> &'static str {
    match level {
        EventLevel::Info => "info",
        EventLevel::Warn => "warn",
        EventLevel::Err => "err",
    }
}

fn kind_str(kind: EventKind) -> &'static str {
    match kind {
        EventKind::ModeChange => "mode_change",
        EventKind::DutyOn => "duty_on",
        EventKind::DutyOff => "duty_off",
        EventKind::Fault => "fault",
        EventKind::Recover => "recover",
        EventKind::Start => "start",
        EventKind::Stop => "stop",
    }
}

fn parse_level(s: &str) -> Result<EventLevel, CoolerError> {
    match s {
        "info" => Ok(EventLevel::Info),
        "warn" => Ok(EventLevel::Warn),
        "err" => Ok(EventLevel::Err),
        other => Err(CoolerError::transient_io(format!("unknown event level: {other}"))),
    }
}

fn parse_kind(s: &str) -> Result<EventKind, CoolerError> {
    match s {
        "mode_change" => Ok(EventKind::ModeChange),
        "duty_on" => Ok(EventKind::DutyOn),
        "duty_off" => Ok(EventKind::DutyOff),
        "fault" => Ok(EventKind::Fault),
        "recover" => Ok(EventKind::Recover),
        "start" => Ok(EventKind::Start),
        "stop" => Ok(EventKind::Stop),
        other => Err(CoolerError::transient_io(format!("unknown event kind: {other}"))),
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord, CoolerError> {
    let ts_str: String = row.try_get("ts").map_err(|e| CoolerError::transient_io(e.to_string()))?;
    let ts = OffsetDateTime::parse(&ts_str, &time::format_description::well_known::Rfc3339)
        .map_err(|e| CoolerError::transient_io(format!("parse ts: {e}")))?;
    let level: String = row.try_get("level").map_err(|e| CoolerError::transient_io(e.to_string()))?;
    let kind: String = row.try_get("kind").map_err(|e| CoolerError::transient_io(e.to_string()))?;

    Ok(EventRecord {
        id: row.try_get("id").map_err(|e| CoolerError::transient_io(e.to_string()))?,
        ts,
        level: parse_level(&level)?,
        kind: parse_kind(&kind)?,
        message: row.try_get("message").map_err(|e| CoolerError::transient_io(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_log() -> Arc<EventLog> {
        EventLog::connect("sqlite::memory:", 1000, 64).await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids() {
        let log = memory_log().await;
        let a = log.append(EventLevel::Info, EventKind::Start, "booting").await.unwrap();
        let b = log.append(EventLevel::Info, EventKind::ModeChange, "mode 1").await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn read_page_is_newest_first() {
        let log = memory_log().await;
        log.append(EventLevel::Info, EventKind::Start, "one").await.unwrap();
        log.append(EventLevel::Info, EventKind::Stop, "two").await.unwrap();
        let page = log.read_page(0, 10).await.unwrap();
        assert_eq!(page[0].message, "two");
        assert_eq!(page[1].message, "one");
    }

    #[tokio::test]
    async fn append_notifies_sse_subscribers() {
        let log = memory_log().await;
        let mut rx = log.subscribe();
        log.append(EventLevel::Warn, EventKind::Fault, "no water").await.unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice, SseNotice::Log);
    }

    #[tokio::test]
    async fn roundtrip_through_sql_preserves_fields() {
        let log = memory_log().await;
        let written = log
            .append(EventLevel::Err, EventKind::Fault, "stuck valve")
            .await
            .unwrap();
        let page = log.read_page(0, 1).await.unwrap();
        let read_back = &page[0];
        assert_eq!(read_back.id, written.id);
        assert_eq!(read_back.level, written.level);
        assert_eq!(read_back.kind, written.kind);
        assert_eq!(read_back.message, written.message);
    }

    #[tokio::test]
    async fn prune_removes_nothing_when_all_recent() {
        let log = memory_log().await;
        log.append(EventLevel::Info, EventKind::Start, "just happened").await.unwrap();
        let removed = log.prune(400).await.unwrap();
        assert_eq!(removed, 0);
    }
}
