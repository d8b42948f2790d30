use rusqlite::{Connection, Result as SqliteResult};
use std::sync::Mutex;
use thiserror::Error;

use crate::calendar::CalendarEvent;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Local mirror of all synced events, keyed by composite id.
pub trait LocalEventStore: Send + Sync {
    fn upsert(&self, events: &[CalendarEvent]) -> Result<(), StoreError>;
    fn delete(&self, ids: &[String]) -> Result<(), StoreError>;
    fn delete_by_account(&self, account_id: &str) -> Result<(), StoreError>;
    fn get_all(&self) -> Result<Vec<CalendarEvent>, StoreError>;
    fn is_empty(&self) -> Result<bool, StoreError>;
}

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                account_id TEXT,
                calendar_id TEXT NOT NULL,
                data TEXT NOT NULL,
                start_utc TEXT NOT NULL,
                end_utc TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_account ON events (account_id)",
            [],
        )?;
        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> bool {
        let conn = self.conn.lock().expect("store lock poisoned");
        let result: SqliteResult<i32> = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table_name],
            |row| row.get(0),
        );
        result.unwrap_or(0) > 0
    }
}

impl LocalEventStore for SqliteEventStore {
    fn upsert(&self, events: &[CalendarEvent]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        for event in events {
            let data = serde_json::to_string(event)?;
            tx.execute(
                "INSERT OR REPLACE INTO events (id, account_id, calendar_id, data, start_utc, end_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    &event.id,
                    &event.account_id,
                    &event.calendar_id,
                    &data,
                    event.start.to_utc().to_rfc3339(),
                    event.end.to_utc().to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM events WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_by_account(&self, account_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM events WHERE account_id = ?1", [account_id])?;
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<CalendarEvent>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare("SELECT data FROM events ORDER BY start_utc")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for data in rows {
            events.push(serde_json::from_str(&data?)?);
        }
        Ok(events)
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count == 0)
    }
}
