//! Fragment data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One atomic unit of remembered text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub content: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// A fragment together with the identity the episodic store assigned to it.
///
/// The id is the only handle used for targeted deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicRecord {
    pub id: i64,
    #[serde(flatten)]
    pub fragment: Fragment,
}

impl EpisodicRecord {
    pub fn content(&self) -> &str {
        &self.fragment.content
    }

    pub fn source(&self) -> &str {
        &self.fragment.source
    }
}

/// Number of episodic fragments per source tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: i64,
}

/// Receipt for a fragment committed to both stores.
#[derive(Debug, Clone, Serialize)]
pub struct CommitReceipt {
    pub record: EpisodicRecord,
    /// Key of the side-table entry that mirrors the record in the vector index.
    pub chunk_key: String,
}

/// Result of a two-phase delete.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[must_use]
pub enum DeleteOutcome {
    /// No episodic record with that id exists. Nothing changed.
    NotFound,
    /// Removed from the episodic store and the vector index was rebuilt.
    Deleted {
        record: EpisodicRecord,
        /// Side-table entries dropped before the rebuild (0 if the fragment was never indexed).
        removed_chunks: usize,
    },
    /// Removed from the episodic store but the vector index rebuild failed.
    /// The fragment is still reachable through semantic search until a rebuild succeeds.
    RebuildFailed { record: EpisodicRecord, reason: String },
}

impl DeleteOutcome {
    pub fn is_consistent(&self) -> bool {
        !matches!(self, DeleteOutcome::RebuildFailed { .. })
    }
}

/// Memory system statistics for operators.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub episodic_count: i64,
    pub sources: Vec<SourceCount>,
    pub indexed_chunks: usize,
    pub dimension: usize,
    /// Size in bytes of the persisted index artifact, if present.
    pub index_bytes: Option<u64>,
    /// Size in bytes of the persisted side table, if present.
    pub side_table_bytes: Option<u64>,
    pub embedder: String,
    pub degraded_embedder: bool,
    pub rebuild_pending: bool,
}
