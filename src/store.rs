//! EpisodicStore - durable keyword-searchable log of fragments.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::db::init_schema;
use crate::error::MemoryError;
use crate::fragment::{EpisodicRecord, Fragment, SourceCount};
use crate::search::fts_search;
use crate::INGEST_DELIMITER;

/// Keyword store backed by SQLite with an FTS5 index.
///
/// Single writer, sequential access. Rows are never updated, only inserted
/// and deleted.
pub struct EpisodicStore {
    conn: Connection,
}

impl EpisodicStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, MemoryError> {
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Split `text` on the `---` delimiter and insert every non-empty piece.
    ///
    /// Returns the number of fragments inserted.
    pub fn ingest(&mut self, text: &str, source: &str) -> Result<usize, MemoryError> {
        Ok(self.ingest_records(text, source)?.len())
    }

    /// Like [`ingest`](Self::ingest) but returns the inserted records.
    ///
    /// All pieces are inserted in one transaction.
    pub fn ingest_records(
        &mut self,
        text: &str,
        source: &str,
    ) -> Result<Vec<EpisodicRecord>, MemoryError> {
        let tx = self.conn.transaction()?;
        let mut records = Vec::new();

        for piece in text.split(INGEST_DELIMITER) {
            let content = piece.trim();
            if content.is_empty() {
                continue;
            }
            records.push(insert_fragment(&tx, content, source, Utc::now())?);
        }

        tx.commit()?;

        info!(source = %source, count = records.len(), "Ingested fragments");
        Ok(records)
    }

    /// Insert a single fragment and return its identity.
    pub fn add(&mut self, content: &str, source: &str) -> Result<i64, MemoryError> {
        Ok(self.add_with_datetime(content, source, None)?.id)
    }

    /// Insert a single fragment with an optional RFC3339 timestamp override.
    pub fn add_with_datetime(
        &mut self,
        content: &str,
        source: &str,
        datetime_str: Option<&str>,
    ) -> Result<EpisodicRecord, MemoryError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MemoryError::InvalidInput(
                "Fragment content cannot be empty".to_string(),
            ));
        }

        let created_at = match datetime_str {
            Some(dt_str) => DateTime::parse_from_rfc3339(dt_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    MemoryError::InvalidInput(format!(
                        "Invalid datetime (expected RFC3339, e.g. '2024-01-15T10:30:00Z'): {}",
                        e
                    ))
                })?,
            None => Utc::now(),
        };

        let record = insert_fragment(&self.conn, content, source, created_at)?;
        info!(id = record.id, source = %source, "Fragment added");
        Ok(record)
    }

    /// Keyword search, best match first. Never fails on odd query syntax.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, MemoryError> {
        fts_search(&self.conn, query, limit)
    }

    /// Remove exactly one fragment. Returns whether it existed.
    pub fn delete(&mut self, id: i64) -> Result<bool, MemoryError> {
        let n = self
            .conn
            .execute("DELETE FROM fragments WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Remove every fragment. Returns how many were removed.
    pub fn wipe(&mut self) -> Result<usize, MemoryError> {
        let n = self.conn.execute("DELETE FROM fragments", [])?;
        warn!(removed = n, "Episodic store wiped");
        Ok(n)
    }

    /// Get a fragment by id.
    pub fn get(&self, id: i64) -> Result<Option<EpisodicRecord>, MemoryError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, created_at, content, source FROM fragments WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// List fragments in insertion order, optionally limited to the first `limit`.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<EpisodicRecord>, MemoryError> {
        // LIMIT -1 means no limit in SQLite
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, content, source FROM fragments ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_record)?;
        let records: Result<Vec<_>, _> = rows.collect();
        Ok(records?)
    }

    /// Rows fed into a vector index rebuild, bounded to `max_rows`.
    pub fn corpus(&self, max_rows: usize) -> Result<Vec<EpisodicRecord>, MemoryError> {
        self.list(Some(max_rows))
    }

    pub fn count(&self) -> Result<i64, MemoryError> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Per-source fragment counts, ordered by source.
    pub fn source_counts(&self) -> Result<Vec<SourceCount>, MemoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT source, COUNT(*) FROM fragments GROUP BY source ORDER BY source",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceCount {
                source: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let counts: Result<Vec<_>, _> = rows.collect();
        Ok(counts?)
    }

    /// Every fragment id, ascending.
    pub fn ids(&self) -> Result<Vec<i64>, MemoryError> {
        let mut stmt = self.conn.prepare("SELECT id FROM fragments ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let ids: Result<Vec<i64>, _> = rows.collect();
        Ok(ids?)
    }

    /// Whether a vector index rebuild was recorded as outstanding.
    pub fn rebuild_pending(&self) -> Result<bool, MemoryError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![REBUILD_PENDING_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref() == Some("1"))
    }

    /// Record (or clear) an outstanding vector index rebuild.
    pub fn set_rebuild_pending(&mut self, pending: bool) -> Result<(), MemoryError> {
        if pending {
            self.conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, '1')
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![REBUILD_PENDING_KEY],
            )?;
        } else {
            self.conn
                .execute("DELETE FROM meta WHERE key = ?1", params![REBUILD_PENDING_KEY])?;
        }
        Ok(())
    }
}

const REBUILD_PENDING_KEY: &str = "rebuild_pending";

fn insert_fragment(
    conn: &Connection,
    content: &str,
    source: &str,
    created_at: DateTime<Utc>,
) -> Result<EpisodicRecord, rusqlite::Error> {
    conn.execute(
        "INSERT INTO fragments (created_at, content, source) VALUES (?1, ?2, ?3)",
        params![created_at.to_rfc3339(), content, source],
    )?;

    Ok(EpisodicRecord {
        id: conn.last_insert_rowid(),
        fragment: Fragment {
            content: content.to_string(),
            source: source.to_string(),
            created_at,
        },
    })
}

/// Convert a row to an EpisodicRecord.
fn row_to_record(row: &rusqlite::Row) -> Result<EpisodicRecord, rusqlite::Error> {
    let datetime_str: String = row.get(1)?;
    let created_at = DateTime::parse_from_rfc3339(&datetime_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(EpisodicRecord {
        id: row.get(0)?,
        fragment: Fragment {
            content: row.get(2)?,
            source: row.get(3)?,
            created_at,
        },
    })
}
