//! SQLite schema for the content index and subscription cursors.
//!
//! Both processes open the same database file. The ingest daemon is the only
//! writer; the feed server opens it with [`open_read_only`].

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::{Error, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// A connection shared between components of one process.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open or create the database at `path`, enable WAL and initialize the schema.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    init_schema(&conn)?;

    tracing::debug!(path = %path.display(), "database opened");
    Ok(conn)
}

/// Open an in-memory database with the schema applied (for testing).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Open the database for reads only.
///
/// A missing file is created and initialized first so the server can start
/// before the ingest daemon has written anything.
pub fn open_read_only(path: &Path) -> Result<Connection> {
    if !path.exists() {
        drop(open(path)?);
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let version = stored_version(&conn)?;
    if version > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    Ok(conn)
}

/// Wrap a connection for sharing.
pub fn shared(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

/// Initialize the database schema.
///
/// Creates all tables if they don't exist and runs any pending migrations.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let current_version = stored_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::info!(version = SCHEMA_VERSION, "database schema created");
    } else if current_version < SCHEMA_VERSION {
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Read the stored schema version (0 if not initialized).
fn stored_version(conn: &Connection) -> Result<i32> {
    let has_table: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(0);
    }

    let version: Option<i32> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Feed content index
        CREATE TABLE IF NOT EXISTS indexed_content (
            content_uri TEXT NOT NULL,
            content_cid TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            list_uri TEXT NOT NULL,
            record_type TEXT NOT NULL CHECK (record_type IN ('post', 'repost')),
            repost_uri TEXT,
            UNIQUE (content_uri, record_type)
        );

        CREATE INDEX IF NOT EXISTS idx_indexed_content_time
            ON indexed_content(indexed_at DESC, content_cid DESC);
        CREATE INDEX IF NOT EXISTS idx_indexed_content_list_time
            ON indexed_content(list_uri, indexed_at DESC);
        CREATE INDEX IF NOT EXISTS idx_indexed_content_repost
            ON indexed_content(repost_uri);

        -- Subscription cursor per stream source
        CREATE TABLE IF NOT EXISTS sub_state (
            service TEXT PRIMARY KEY,
            cursor INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    Ok(())
}

/// Run migrations from one version to another.
///
/// Each step upgrades `version` to `version + 1`; there are none yet past v1.
fn migrate(conn: &Connection, from: i32, to: i32) -> Result<()> {
    for version in from..to {
        tracing::info!(from = version, to = version + 1, "migrating database schema");
    }
    set_schema_version(conn, to)?;
    Ok(())
}
