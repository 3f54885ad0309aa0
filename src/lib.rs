//! Companion Memory
//!
//! Hybrid episodic + semantic memory for a long-lived conversational agent,
//! plus a small classifier that tracks whether the user is physically present.
//!
//! # Example
//!
//! ```no_run
//! use companion_memory::{MemoryConfig, MemoryContext, MemoryError};
//!
//! fn main() -> Result<(), MemoryError> {
//!     let mut ctx = MemoryContext::open(MemoryConfig::default())?;
//!
//!     // Commit a summary after a conversation cycle
//!     ctx.memory.commit_fragment("We talked about the trip to Lisbon.", "summary")?;
//!
//!     // Only pulls memories when the turn asks about the past
//!     if let Some(block) = ctx.memory.memory_section("do you remember Lisbon?")? {
//!         println!("{}", block);
//!     }
//!
//!     ctx.proximity.detect_state("*sits down next to you*", "");
//!     if let Some(block) = ctx.proximity.emission_block(true) {
//!         println!("{}", block);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod embedder;
pub mod error;
pub mod fragment;
pub mod index;
pub mod orchestrator;
pub mod proximity;
mod search;
pub mod store;

// ============================================================================
// Configuration Constants
// ============================================================================
//
// ## Ingestion
//
// ### INGEST_DELIMITER ("---")
// Bulk text is split on this marker; each trimmed, non-empty piece becomes
// one fragment.
//
// ## Retrieval
//
// ### DEFAULT_EPISODIC_LIMIT (3) / DEFAULT_SEMANTIC_LIMIT (5)
// How many candidates each store is asked for when intent gating fires.
//
// ### SEMANTIC_KEEP (3) / EPISODIC_KEEP (2)
// How many of those candidates make it into the rendered block. Semantic
// hits go first; keyword hits are dropped if their text is already there.
//
// ### MAX_BULLET_LEN (150)
// Characters per bullet before cutting back to the last word boundary.
//
// ### REBUILD_SCAN_LIMIT (1000)
// Episodic rows folded into a full vector index rebuild.
//
// ## Lore
//
// ### LORE_PARAGRAPH_CHARS (250)
// Lore paragraphs up to this length are indexed whole. Longer ones are cut
// into overlapping two-sentence windows.
//
// ### DEFAULT_LORE_LIMIT (4) / LORE_DEDUP_PREFIX (50)
// Lore bullets per block. Overlapping windows often share an opening
// sentence, so chunks whose first 50 characters repeat are dropped.
//
// ## Proximity
//
// ### CONFIDENCE_THRESHOLD (0.45)
// Best-anchor cosine similarity must be strictly greater than this to move
// the state. Anything at or below keeps the current state.
//
// ### SHORT_TURN_CHARS (10)
// Turns shorter than this ("ok", "bye") carry too little signal on their
// own and are embedded together with the previous turn.

/// Separator between fragments in bulk-ingested text.
pub const INGEST_DELIMITER: &str = "---";

/// Rendered in place of bullets when nothing was retrieved.
pub const NOTHING_RETRIEVED: &str = "- No specific memories retrieved.";

/// Rendered when no lore chunk matches.
pub const LORE_FALLBACK: &str = "- AI is a helpful assistant connected to User.";

/// Embedding dimension of the default model (nomic-embed-text-v1.5).
pub const DEFAULT_DIMENSION: usize = 768;

/// Keyword candidates requested by intent-gated retrieval.
pub const DEFAULT_EPISODIC_LIMIT: usize = 3;

/// Semantic candidates requested by intent-gated retrieval.
pub const DEFAULT_SEMANTIC_LIMIT: usize = 5;

/// Semantic results kept in a rendered block.
pub const SEMANTIC_KEEP: usize = 3;

/// Keyword results considered for a rendered block.
pub const EPISODIC_KEEP: usize = 2;

/// Maximum characters per rendered bullet.
pub const MAX_BULLET_LEN: usize = 150;

/// Maximum episodic rows scanned by a full rebuild.
pub const REBUILD_SCAN_LIMIT: usize = 1000;

/// Longest lore paragraph indexed as a single chunk.
pub const LORE_PARAGRAPH_CHARS: usize = 250;

/// Lore bullets returned by default.
pub const DEFAULT_LORE_LIMIT: usize = 4;

/// Leading characters compared when deduplicating lore chunks.
pub const LORE_DEDUP_PREFIX: usize = 50;

/// Minimum (exclusive) anchor similarity for a proximity change.
pub const CONFIDENCE_THRESHOLD: f32 = 0.45;

/// Turns shorter than this many characters are blended with the prior turn.
pub const SHORT_TURN_CHARS: usize = 10;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{
    EmbeddingBackend, EmbeddingConfig, FileSource, MemoryConfig, ProximityConfig, RetrievalConfig,
};
pub use context::MemoryContext;
pub use db::default_data_dir;
pub use embedder::{cosine_similarity, select_embedder, Embedder, HashEmbedder};
#[cfg(feature = "fastembed")]
pub use embedder::FastEmbedder;
pub use error::MemoryError;
pub use fragment::{
    CommitReceipt, DeleteOutcome, EpisodicRecord, Fragment, MemoryStats, SourceCount,
};
pub use index::{IndexedChunk, LoadOutcome, ScoredChunk, VectorIndex};
pub use orchestrator::{chunk_lore, is_memory_intent, IndexStatus, MemoryOrchestrator};
pub use proximity::{
    AnchorScores, ClassifierSession, Detection, ProximityClassifier, ProximityState,
};
pub use store::EpisodicStore;
