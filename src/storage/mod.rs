//! SQLite storage layer -- ring index persistence and the trigger audit log.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::detect::TriggerEvent;
use crate::recorder::RingIndexStore;
use crate::trigger::{ExportReport, TriggerAudit};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

// ----------------------------------------------------------------------------
// Ring index
// ----------------------------------------------------------------------------

/// Ring index persisted in the `ring_state` table.
#[derive(Clone)]
pub struct SqliteIndexStore {
    pool: Pool,
}

impl SqliteIndexStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl RingIndexStore for SqliteIndexStore {
    fn load(&self, name: &str) -> Result<Option<usize>> {
        let conn = self.pool.get()?;
        let index: Option<i64> = conn
            .query_row(
                "SELECT ring_index FROM ring_state WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(index.and_then(|i| usize::try_from(i).ok()))
    }

    fn save(&self, name: &str, index: usize) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO ring_state (name, ring_index, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET ring_index = excluded.ring_index,
                                             updated_at = excluded.updated_at",
            params![name, index as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Trigger audit log
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TriggerRecord {
    pub id: Uuid,
    pub event_ts: u64,
    pub source: String,
    pub destination: String,
    pub files: Vec<String>,
    pub exported: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
}

pub struct TriggerLog {
    pool: Pool,
}

impl TriggerLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<TriggerRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_ts, source, destination, files_json, exported, failed, created_at
             FROM trigger_log ORDER BY created_at DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: String = row.get(0)?;
            let event_ts: i64 = row.get(1)?;
            let files_json: String = row.get(4)?;
            let exported: i64 = row.get(5)?;
            let failed: i64 = row.get(6)?;
            let created_at: String = row.get(7)?;

            Ok(TriggerRecord {
                id: Uuid::parse_str(&id).map_err(|e| corrupt_column(0, e))?,
                event_ts: event_ts.max(0) as u64,
                source: row.get(2)?,
                destination: row.get(3)?,
                files: serde_json::from_str(&files_json).map_err(|e| corrupt_column(4, e))?,
                exported: exported.max(0) as usize,
                failed: failed.max(0) as usize,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| corrupt_column(7, e))?,
            })
        })?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }
}

/// A stored text column that does not parse back into its type.
fn corrupt_column<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

impl TriggerAudit for TriggerLog {
    fn record(&self, event: &TriggerEvent, report: &ExportReport) -> Result<Uuid> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4();
        let files: Vec<String> = report
            .outcomes
            .iter()
            .map(|o| o.source.display().to_string())
            .collect();

        conn.execute(
            "INSERT INTO trigger_log
                (id, event_ts, source, destination, files_json, exported, failed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                event.timestamp_ms as i64,
                event.source.to_string(),
                report.destination,
                serde_json::to_string(&files)?,
                report.exported() as i64,
                report.failed() as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(id)
    }
}
