//! Durable stream positions per subscription source.
//!
//! Positions live in the `sub_state` table and only ever move forward:
//! writes use `MAX(old, new)` so a replayed batch can never rewind them.

use chrono::Utc;
use lightbox_core::SharedConnection;
use rusqlite::OptionalExtension;
use rusqlite::types::Value;

use crate::{Error, Result};

/// One stored cursor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub service: String,
    pub position: i64,
    /// Unix seconds of the last write.
    pub updated_at: i64,
}

/// Reads and advances stream cursors.
#[derive(Clone)]
pub struct CursorStore {
    conn: SharedConnection,
}

impl CursorStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Last persisted position for `service`, or `None` on a fresh start.
    ///
    /// A stored value that is negative or not an integer is reported as
    /// [`Error::CorruptCursor`]; resuming from it would silently skip or
    /// replay an unknown range.
    pub fn get(&self, service: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();

        let stored: Option<Value> = conn
            .query_row(
                "SELECT cursor FROM sub_state WHERE service = ?",
                [service],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            None => Ok(None),
            Some(Value::Integer(position)) if position >= 0 => Ok(Some(position)),
            Some(other) => Err(Error::CorruptCursor {
                service: service.to_string(),
                value: format!("{other:?}"),
            }),
        }
    }

    /// Persist `position` for `service`, never moving it backwards.
    pub fn set(&self, service: &str, position: i64) -> Result<()> {
        if position < 0 {
            return Err(Error::CorruptCursor {
                service: service.to_string(),
                value: position.to_string(),
            });
        }

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sub_state (service, cursor, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(service) DO UPDATE SET
                cursor = MAX(cursor, excluded.cursor),
                updated_at = excluded.updated_at",
            rusqlite::params![service, position, Utc::now().timestamp()],
        )?;

        Ok(())
    }

    /// Get all cursors (for debugging/introspection).
    pub fn all(&self) -> Result<Vec<CursorState>> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT service, cursor, updated_at FROM sub_state ORDER BY service")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(CursorState {
                    service: row.get(0)?,
                    position: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }
}
