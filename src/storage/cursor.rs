use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::sync::Mutex;

use super::store::StoreError;

/// Per-calendar sync position. A missing row reads back as the default
/// cursor, which the orchestrator treats as "never synced".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncCursor {
    pub token: Option<String>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

pub trait SyncCursorStore: Send + Sync {
    fn get(&self, calendar_id: &str) -> Result<SyncCursor, StoreError>;
    fn set(&self, calendar_id: &str, cursor: &SyncCursor) -> Result<(), StoreError>;
    fn clear(&self, calendar_id: &str) -> Result<(), StoreError>;
    fn clear_all(&self) -> Result<(), StoreError>;
}

pub struct SqliteCursorStore {
    conn: Mutex<Connection>,
}

impl SqliteCursorStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("cursor lock poisoned");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_cursors (
                calendar_id TEXT PRIMARY KEY,
                token TEXT,
                last_full_sync_at TEXT
            )",
            [],
        )?;
        Ok(())
    }
}

impl SyncCursorStore for SqliteCursorStore {
    fn get(&self, calendar_id: &str) -> Result<SyncCursor, StoreError> {
        let conn = self.conn.lock().expect("cursor lock poisoned");
        let row = conn
            .query_row(
                "SELECT token, last_full_sync_at FROM sync_cursors WHERE calendar_id = ?1",
                [calendar_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?;

        let Some((token, stamp)) = row else {
            return Ok(SyncCursor::default());
        };
        let last_full_sync_at = stamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(SyncCursor {
            token,
            last_full_sync_at,
        })
    }

    fn set(&self, calendar_id: &str, cursor: &SyncCursor) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("cursor lock poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO sync_cursors (calendar_id, token, last_full_sync_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![
                calendar_id,
                &cursor.token,
                cursor.last_full_sync_at.map(|dt| dt.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn clear(&self, calendar_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("cursor lock poisoned");
        conn.execute(
            "DELETE FROM sync_cursors WHERE calendar_id = ?1",
            [calendar_id],
        )?;
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("cursor lock poisoned");
        conn.execute("DELETE FROM sync_cursors", [])?;
        Ok(())
    }
}
