//! Database initialization and low-level helpers.

use std::path::PathBuf;

use rusqlite::{Connection, Result};

/// Get the default data directory (`<data dir>/companion-memory`).
///
/// Falls back to `./companion-memory` when the platform has no data directory.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("companion-memory")
}

/// Initialize the database schema.
pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fragments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            content TEXT NOT NULL,
            source TEXT NOT NULL
        )",
        [],
    )?;

    // External-content FTS5 table; only the content column is searchable
    conn.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS fragments_fts USING fts5(
            content,
            content=fragments,
            content_rowid=id
        )",
        [],
    )?;

    // Keep FTS in sync
    conn.execute_batch(
        "
        CREATE TRIGGER IF NOT EXISTS fragments_ai AFTER INSERT ON fragments BEGIN
            INSERT INTO fragments_fts(rowid, content) VALUES (new.id, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS fragments_ad AFTER DELETE ON fragments BEGIN
            INSERT INTO fragments_fts(fragments_fts, rowid, content)
                VALUES('delete', old.id, old.content);
        END;

        CREATE TRIGGER IF NOT EXISTS fragments_au AFTER UPDATE ON fragments BEGIN
            INSERT INTO fragments_fts(fragments_fts, rowid, content)
                VALUES('delete', old.id, old.content);
            INSERT INTO fragments_fts(rowid, content) VALUES (new.id, new.content);
        END;
        ",
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fragments_source ON fragments(source)",
        [],
    )?;

    // Small key/value table for flags that must survive a restart
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}
