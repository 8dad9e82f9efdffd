//! Append-only attendance log.
//!
//! Uses its own connection to the database file, so appends never queue behind
//! gallery reads on the user store's connection. Records are never updated or
//! deleted.

use crate::store::{now_timestamp, open_connection, StoreError};
use rusqlite::params;
use serde::Serialize;
use std::path::Path;
use tokio_rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: i64,
    pub user_id: String,
    /// Display name at the time of recognition.
    pub name: String,
    /// RFC 3339 UTC.
    pub timestamp: String,
    pub confidence: f32,
}

#[derive(Clone)]
pub struct AttendanceLedger {
    conn: Connection,
}

impl AttendanceLedger {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path).await?;
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS attendance (
                    id         INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id    TEXT NOT NULL,
                    name       TEXT NOT NULL,
                    timestamp  TEXT NOT NULL,
                    confidence REAL NOT NULL
                );
                CREATE INDEX IF NOT EXISTS attendance_by_time ON attendance(timestamp);",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Record one recognition event stamped with the current time.
    pub async fn append(&self, user_id: &str, name: &str, confidence: f32) -> Result<AttendanceRecord, StoreError> {
        let mut record = AttendanceRecord {
            id: 0,
            user_id: user_id.to_string(),
            name: name.to_string(),
            timestamp: now_timestamp(),
            confidence,
        };
        let row = record.clone();
        record.id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (user_id, name, timestamp, confidence) VALUES (?1, ?2, ?3, ?4)",
                    params![row.user_id, row.name, row.timestamp, row.confidence as f64],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(record)
    }

    /// Every record, newest first.
    pub async fn list_all(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let records = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, name, timestamp, confidence FROM attendance
                     ORDER BY timestamp DESC, id DESC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(AttendanceRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        timestamp: row.get(3)?,
                        confidence: row.get::<_, f64>(4)? as f32,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(records)
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await?;
        Ok(count)
    }
}
