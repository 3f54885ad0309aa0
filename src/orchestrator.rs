//! MemoryOrchestrator - hybrid retrieval and the write paths that keep the
//! episodic store and the vector index in step.

use std::cell::Cell;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{FileSource, MemoryConfig};
use crate::embedder::Embedder;
use crate::error::MemoryError;
use crate::fragment::{CommitReceipt, DeleteOutcome, EpisodicRecord, MemoryStats};
use crate::index::{IndexedChunk, LoadOutcome, VectorIndex};
use crate::store::EpisodicStore;
use crate::{LORE_DEDUP_PREFIX, LORE_FALLBACK, LORE_PARAGRAPH_CHARS, NOTHING_RETRIEVED};

/// Phrases that signal the user is asking about shared history.
static MEMORY_INDICATORS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"\bremember\b",
        r"\brecall\b",
        r"\bremind\b",
        r"\bthat time\b",
        r"\bthe other day\b",
        r"\blast time\b",
        r"\bwe talked about\b",
        r"\bwe discussed\b",
        r"\byou said\b",
        r"\byou told me\b",
        r"\byou mentioned\b",
        r"\bwhat happened\b",
        r"\bwhat did we\b",
        r"\bwhen we\b",
        r"\btell me about\b",
        r"\bhow was\b",
        r"\bwhat was\b",
        r"\bdid you say\b",
        r"\bdid we\b",
        r"\bhave you\b.*\bforgotten\b",
        r"\bforget\b",
        r"\bforgot\b",
        r"\bwhat about\b",
    ])
    .unwrap_or_else(|_| RegexSet::empty())
});

/// Whether the query asks about past events.
pub fn is_memory_intent(query: &str) -> bool {
    let text = query.trim().to_lowercase();
    let matched = MEMORY_INDICATORS.is_match(&text);
    if matched {
        let preview: String = text.chars().take(60).collect();
        debug!(query = %preview, "Memory intent detected");
    }
    matched
}

/// Consistency state between the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// Every episodic row that should be indexed is.
    Consistent,
    /// A rebuild failed after an episodic change; the vector index is stale.
    RebuildPending,
}

/// Side-table key for an episodic row.
pub fn episode_key(id: i64) -> String {
    format!("episode:{}", id)
}

fn parse_episode_key(key: &str) -> Option<i64> {
    key.strip_prefix("episode:")?.parse().ok()
}

fn episode_chunk(record: &EpisodicRecord) -> IndexedChunk {
    IndexedChunk::new(
        episode_key(record.id),
        format!("episode/{}", record.source()),
        record.content(),
    )
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace and cut to `max_len` characters at a word boundary.
pub fn normalize_bullet(text: &str, max_len: usize) -> String {
    let collapsed = collapse_whitespace(text);
    if collapsed.chars().count() <= max_len {
        return collapsed;
    }

    let cut: String = collapsed.chars().take(max_len).collect();
    let head = match cut.rsplit_once(' ') {
        Some((head, _)) => head,
        None => cut.as_str(),
    };
    format!("{}...", head)
}

/// Render memories as `- ` bullets, or the sentinel line when there are none.
pub fn render_bullets(memories: &[String], max_len: usize) -> String {
    if memories.is_empty() {
        return NOTHING_RETRIEVED.to_string();
    }
    memories
        .iter()
        .map(|m| format!("- {}", normalize_bullet(m, max_len)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split lore text into retrieval-sized chunks.
///
/// Paragraphs (blank-line separated) up to [`LORE_PARAGRAPH_CHARS`] stay
/// whole. Longer ones become overlapping windows of two consecutive
/// sentences, so every sentence appears next to its neighbours.
pub fn chunk_lore(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if para.chars().count() <= LORE_PARAGRAPH_CHARS {
            chunks.push(para.to_string());
            continue;
        }

        let sentences: Vec<&str> = para
            .split(". ")
            .map(|s| s.trim())
            .map(|s| s.strip_suffix('.').unwrap_or(s))
            .filter(|s| !s.is_empty())
            .collect();

        if sentences.len() < 2 {
            chunks.push(para.to_string());
            continue;
        }
        for pair in sentences.windows(2) {
            chunks.push(format!("{}. {}.", pair[0], pair[1]));
        }
    }

    chunks
}

fn file_chunks(source: &FileSource, text: &str) -> Vec<IndexedChunk> {
    if !source.chunked {
        return vec![IndexedChunk::new(source.key.clone(), source.key.clone(), text)];
    }
    chunk_lore(text)
        .into_iter()
        .enumerate()
        .map(|(n, chunk)| {
            IndexedChunk::new(format!("{}#{}", source.key, n), source.key.clone(), chunk)
        })
        .collect()
}

/// Gather every chunk a full rebuild indexes: file sources first, then episodic rows.
fn collect_corpus(
    file_sources: &[FileSource],
    store: &EpisodicStore,
    scan_limit: usize,
) -> Result<Vec<IndexedChunk>, MemoryError> {
    let mut chunks = Vec::new();

    for fs_source in file_sources {
        let text = match fs::read_to_string(&fs_source.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(
                    key = %fs_source.key,
                    path = %fs_source.path.display(),
                    "File source missing, skipped"
                );
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        chunks.extend(file_chunks(fs_source, text));
    }

    let files = chunks.len();
    chunks.extend(store.corpus(scan_limit)?.iter().map(episode_chunk));
    debug!(files, episodes = chunks.len() - files, "Collected rebuild corpus");
    Ok(chunks)
}

/// Whether the episodic entries of a loaded index disagree with the store.
///
/// Indexed ids missing from the store are always stale. Stored ids missing
/// from the index only count while the whole store fits in a rebuild scan.
fn index_is_stale(
    index: &VectorIndex,
    store: &EpisodicStore,
    scan_limit: usize,
) -> Result<bool, MemoryError> {
    let indexed: HashSet<i64> = index
        .chunks()
        .iter()
        .filter_map(|c| parse_episode_key(&c.key))
        .collect();
    let stored: HashSet<i64> = store.ids()?.into_iter().collect();

    let deleted = indexed.difference(&stored).count();
    let missing = if stored.len() <= scan_limit {
        stored.difference(&indexed).count()
    } else {
        0
    };

    if deleted > 0 || missing > 0 {
        warn!(deleted, missing, "Vector index out of step with episodic store");
        return Ok(true);
    }
    Ok(false)
}

/// Fans queries out to both stores and owns every write that touches them.
pub struct MemoryOrchestrator {
    store: EpisodicStore,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
    load_outcome: LoadOutcome,
    rebuild_pending: bool,
}

impl MemoryOrchestrator {
    /// Open the episodic store and load (or build) the vector index.
    pub fn open(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Result<Self, MemoryError> {
        config.validate()?;

        let mut store = EpisodicStore::open(&config.db_path)?;
        let scan_limit = config.retrieval.rebuild_scan_limit;
        let (mut index, mut load_outcome) =
            VectorIndex::load_or_build(&config.index_dir, embedder.clone(), || {
                collect_corpus(&config.file_sources, &store, scan_limit)
            })?;

        // A fresh build already reflects the store; a loaded index may not
        let mut rebuild_pending = false;
        if load_outcome == LoadOutcome::Loaded {
            let flagged = store.rebuild_pending()?;
            if flagged || index_is_stale(&index, &store, scan_limit)? {
                let rebuilt = collect_corpus(&config.file_sources, &store, scan_limit)
                    .and_then(|chunks| index.build(chunks));
                match rebuilt {
                    Ok(()) => {
                        info!(flagged, chunks = index.len(), "Stale vector index rebuilt");
                        load_outcome = LoadOutcome::RebuiltStale;
                    }
                    Err(e) => {
                        warn!(error = %e, "Stale vector index could not be rebuilt");
                        rebuild_pending = true;
                    }
                }
            }
        }
        store.set_rebuild_pending(rebuild_pending)?;

        info!(
            db = %config.db_path.display(),
            index = %config.index_dir.display(),
            embedder = embedder.name(),
            degraded = embedder.is_degraded(),
            outcome = ?load_outcome,
            "Memory opened"
        );

        Ok(Self {
            store,
            index,
            embedder,
            config,
            load_outcome,
            rebuild_pending,
        })
    }

    /// Retrieve memories relevant to `query` as a rendered bullet block.
    ///
    /// Semantic hits come first; keyword hits follow unless their text is
    /// already present. Never mutates state.
    pub fn retrieve(
        &self,
        query: &str,
        episodic_limit: usize,
        semantic_limit: usize,
    ) -> Result<String, MemoryError> {
        let retrieval = &self.config.retrieval;

        let semantic = self.index.search(query, semantic_limit);
        let episodes = self.store.search(query, episodic_limit)?;

        let mut memories: Vec<String> = semantic
            .iter()
            .take(retrieval.semantic_keep)
            .map(|hit| hit.text.clone())
            .collect();

        for episode in episodes.iter().take(retrieval.episodic_keep) {
            if !memories.contains(episode) {
                memories.push(episode.clone());
            }
        }

        info!(
            found = memories.len(),
            semantic = semantic.len(),
            episodic = episodes.len(),
            "Memory retrieval"
        );
        Ok(render_bullets(&memories, retrieval.max_bullet_len))
    }

    /// Retrieve with the configured limits, but only when the query asks about the past.
    pub fn memory_section(&self, query: &str) -> Result<Option<String>, MemoryError> {
        if !is_memory_intent(query) {
            return Ok(None);
        }
        let retrieval = &self.config.retrieval;
        self.retrieve(query, retrieval.episodic_limit, retrieval.semantic_limit)
            .map(Some)
    }

    /// Up to `k` lore chunks relevant to `query`, rendered as bullets.
    ///
    /// Searches `2k` neighbours and keeps only `lore/` sources, skipping
    /// chunks whose opening characters repeat an earlier one. Falls back to
    /// a fixed line when no lore matches.
    pub fn lore_section(&self, query: &str, k: usize) -> String {
        let hits = self.index.search(query, k.saturating_mul(2));

        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        for hit in &hits {
            if lines.len() >= k {
                break;
            }
            if !hit.source.starts_with("lore/") {
                continue;
            }
            let prefix: String = hit.text.chars().take(LORE_DEDUP_PREFIX).collect();
            if !seen.insert(prefix) {
                continue;
            }
            let clean = collapse_whitespace(&hit.text);
            if !clean.is_empty() {
                lines.push(format!("- {}", clean));
            }
        }

        debug!(candidates = hits.len(), kept = lines.len(), "Lore retrieval");
        if lines.is_empty() {
            return LORE_FALLBACK.to_string();
        }
        lines.join("\n")
    }

    /// [`lore_section`](Self::lore_section) with the configured limit.
    pub fn relevant_lore(&self, query: &str) -> String {
        self.lore_section(query, self.config.retrieval.lore_limit)
    }

    /// Commit a fragment to both stores.
    ///
    /// The episodic insert happens first. If the vector append fails the row
    /// is deleted again and [`MemoryError::IndexWrite`] is returned; if that
    /// delete fails too the error is [`MemoryError::CompensationFailed`] and
    /// the orchestrator is marked as needing a rebuild.
    pub fn commit_fragment(
        &mut self,
        text: &str,
        source: &str,
    ) -> Result<CommitReceipt, MemoryError> {
        let record = self.store.add_with_datetime(text, source, None)?;
        let chunk = episode_chunk(&record);
        let chunk_key = chunk.key.clone();

        if let Err(e) = self.index.append(chunk) {
            let reason = e.to_string();
            return match self.store.delete(record.id) {
                Ok(_) => {
                    warn!(
                        id = record.id,
                        error = %reason,
                        "Vector append failed, episodic row removed"
                    );
                    Err(MemoryError::IndexWrite {
                        id: record.id,
                        reason,
                    })
                }
                Err(rollback) => {
                    error!(
                        id = record.id,
                        error = %reason,
                        rollback = %rollback,
                        "Vector append failed and episodic row could not be removed"
                    );
                    self.mark_rebuild_pending();
                    Err(MemoryError::CompensationFailed {
                        id: record.id,
                        reason,
                        rollback: rollback.to_string(),
                    })
                }
            };
        }

        info!(id = record.id, source = %source, "Fragment committed");
        Ok(CommitReceipt { record, chunk_key })
    }

    /// Two-phase delete: episodic row first, then a vector index rebuild without it.
    pub fn delete_fragment(&mut self, id: i64) -> Result<DeleteOutcome, MemoryError> {
        let Some(record) = self.store.get(id)? else {
            return Ok(DeleteOutcome::NotFound);
        };
        self.store.delete(id)?;

        let key = episode_key(id);
        let result = if self.index.chunks().iter().any(|c| c.key == key) {
            self.index.remove_and_rebuild(|c| c.key == key)
        } else {
            // Chunks indexed before keys existed: drop the first exact-text match
            let taken = Cell::new(false);
            let content = record.content();
            self.index.remove_and_rebuild(|c| {
                if !taken.get() && c.text == content {
                    taken.set(true);
                    true
                } else {
                    false
                }
            })
        };

        match result {
            Ok(removed_chunks) => {
                info!(id, removed_chunks, "Fragment deleted");
                Ok(DeleteOutcome::Deleted {
                    record,
                    removed_chunks,
                })
            }
            Err(e) => {
                warn!(
                    id,
                    error = %e,
                    "Fragment deleted from episodic store but vector rebuild failed"
                );
                self.mark_rebuild_pending();
                Ok(DeleteOutcome::RebuildFailed {
                    record,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Episodic fragments in insertion order.
    pub fn list_fragments(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<EpisodicRecord>, MemoryError> {
        self.store.list(limit)
    }

    /// Remove every episodic fragment, then rebuild the index from file sources.
    ///
    /// Returns the number of fragments removed.
    pub fn wipe(&mut self) -> Result<usize, MemoryError> {
        let removed = self.store.wipe()?;
        self.mark_rebuild_pending();
        self.rebuild()?;
        Ok(removed)
    }

    /// Rebuild the vector index from every upstream source and clear any
    /// pending-rebuild mark, including the one persisted in the episodic store.
    ///
    /// Returns the number of indexed chunks.
    pub fn rebuild(&mut self) -> Result<usize, MemoryError> {
        let chunks = collect_corpus(
            &self.config.file_sources,
            &self.store,
            self.config.retrieval.rebuild_scan_limit,
        )?;
        self.index.build(chunks)?;
        self.store.set_rebuild_pending(false)?;
        self.rebuild_pending = false;
        info!(chunks = self.index.len(), "Vector index rebuilt");
        Ok(self.index.len())
    }

    /// Ingest a `---` delimited file, tagging fragments with the file name.
    ///
    /// Returns the number of fragments imported. If the vector append fails
    /// the fragments stay keyword-searchable and a rebuild is marked pending.
    pub fn import_file(&mut self, path: impl AsRef<Path>) -> Result<usize, MemoryError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                MemoryError::InvalidInput(format!("Not a file: {}", path.display()))
            })?;

        let records = self.store.ingest_records(&text, &source)?;
        let chunks: Vec<IndexedChunk> = records.iter().map(episode_chunk).collect();

        if let Err(e) = self.index.append_batch(chunks) {
            warn!(
                file = %path.display(),
                error = %e,
                "Imported fragments not indexed, rebuild pending"
            );
            self.mark_rebuild_pending();
            return Err(e);
        }

        info!(file = %path.display(), count = records.len(), "File imported");
        Ok(records.len())
    }

    pub fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let (index_bytes, side_table_bytes) = self.index.artifact_sizes();
        Ok(MemoryStats {
            episodic_count: self.store.count()?,
            sources: self.store.source_counts()?,
            indexed_chunks: self.index.len(),
            dimension: self.index.dimension(),
            index_bytes,
            side_table_bytes,
            embedder: self.embedder.name().to_string(),
            degraded_embedder: self.embedder.is_degraded(),
            rebuild_pending: self.rebuild_pending,
        })
    }

    pub fn status(&self) -> IndexStatus {
        if self.rebuild_pending {
            IndexStatus::RebuildPending
        } else {
            IndexStatus::Consistent
        }
    }

    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    /// Flag the index as stale, in memory and in the episodic store so the
    /// next `open` rebuilds even if this process exits first.
    fn mark_rebuild_pending(&mut self) {
        self.rebuild_pending = true;
        if let Err(e) = self.store.set_rebuild_pending(true) {
            warn!(error = %e, "Could not persist pending-rebuild flag");
        }
    }

    /// How the vector index was obtained when this orchestrator opened.
    pub fn load_outcome(&self) -> LoadOutcome {
        self.load_outcome
    }

    pub fn store(&self) -> &EpisodicStore {
        &self.store
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }
}
