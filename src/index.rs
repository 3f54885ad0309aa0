//! VectorIndex - exact nearest-neighbour search over embedded fragments.
//!
//! The index is two paired artifacts in one directory:
//!
//! - `semantic.index`: bincode-encoded matrix of normalized vectors, plus the
//!   ordered chunk keys and the vector dimension
//! - `semantic_chunks.json`: the ordered side table of [`IndexedChunk`]s
//!
//! Row `i` of the matrix always belongs to entry `i` of the side table. Both
//! are mutated together in memory and persisted together on disk; a load that
//! finds them disagreeing (length, keys or dimension) discards both and
//! rebuilds.

use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::embedder::{normalize, Embedder};
use crate::error::MemoryError;

const INDEX_FILE: &str = "semantic.index";
const CHUNKS_FILE: &str = "semantic_chunks.json";
const FORMAT_VERSION: u32 = 1;

/// One side-table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedChunk {
    /// Stable identity, e.g. `episode:42` or `lore/self`.
    pub key: String,
    pub source: String,
    pub text: String,
}

impl IndexedChunk {
    pub fn new(key: impl Into<String>, source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
            text: text.into(),
        }
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub key: String,
    pub source: String,
    pub text: String,
    /// Cosine similarity to the query.
    pub score: f32,
}

/// How [`VectorIndex::load_or_build`] obtained its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Persisted artifacts were valid and loaded as-is.
    Loaded,
    /// No artifacts existed; built from the corpus.
    BuiltFresh,
    /// Persisted dimension differed from the embedder's; rebuilt.
    RebuiltDimensionMismatch,
    /// Only one artifact existed, or they disagreed, or could not be decoded; rebuilt.
    RebuiltInvalid,
    /// Artifacts loaded fine but no longer matched the episodic store; rebuilt.
    RebuiltStale,
}

/// On-disk form of the vector matrix.
#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    dimension: usize,
    keys: Vec<String>,
    vectors: Vec<f32>,
}

/// Dense row-major matrix of unit vectors.
#[derive(Debug, Clone, Default)]
struct Matrix {
    dimension: usize,
    data: Vec<f32>,
}

impl Matrix {
    fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    fn rows(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    fn push(&mut self, mut v: Vec<f32>) {
        // A short or long row would shift every later row out of alignment
        v.resize(self.dimension, 0.0);
        normalize(&mut v);
        self.data.extend_from_slice(&v);
    }

    fn truncate(&mut self, rows: usize) {
        self.data.truncate(rows * self.dimension);
    }

    /// Exact inner-product top-k. Ties go to the lower ordinal.
    fn top_k(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if self.dimension == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(i, row)| (i, row.iter().zip(query).map(|(a, b)| a * b).sum()))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

#[derive(Debug, Clone)]
struct IndexPaths {
    dir: PathBuf,
    index: PathBuf,
    chunks: PathBuf,
}

impl IndexPaths {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            index: dir.join(INDEX_FILE),
            chunks: dir.join(CHUNKS_FILE),
        }
    }
}

/// Similarity index plus its positionally aligned side table.
///
/// Not safe to share between processes: one process per index directory.
pub struct VectorIndex {
    paths: IndexPaths,
    embedder: Arc<dyn Embedder>,
    chunks: Vec<IndexedChunk>,
    matrix: Matrix,
}

impl VectorIndex {
    /// Load the persisted index from `dir`, or build it from `corpus` when the
    /// artifacts are missing, partial, inconsistent, or of the wrong dimension.
    pub fn load_or_build<F>(
        dir: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
        corpus: F,
    ) -> Result<(Self, LoadOutcome), MemoryError>
    where
        F: FnOnce() -> Result<Vec<IndexedChunk>, MemoryError>,
    {
        let paths = IndexPaths::new(dir.as_ref());
        fs::create_dir_all(&paths.dir)?;

        let mut index = Self {
            matrix: Matrix::new(embedder.dimension()),
            paths,
            embedder,
            chunks: Vec::new(),
        };

        let outcome = match index.try_load() {
            Ok(()) => {
                info!(chunks = index.len(), "Loaded vector index");
                return Ok((index, LoadOutcome::Loaded));
            }
            Err(outcome) => outcome,
        };

        index.build(corpus()?)?;
        Ok((index, outcome))
    }

    /// Attempt to load both artifacts. On failure returns which rebuild reason applies.
    fn try_load(&mut self) -> Result<(), LoadOutcome> {
        let has_index = self.paths.index.exists();
        let has_chunks = self.paths.chunks.exists();

        match (has_index, has_chunks) {
            (false, false) => {
                info!(dir = %self.paths.dir.display(), "No vector index yet");
                return Err(LoadOutcome::BuiltFresh);
            }
            (true, true) => {}
            _ => {
                warn!(
                    has_index,
                    has_chunks, "Only one vector index artifact present, rebuilding"
                );
                return Err(LoadOutcome::RebuiltInvalid);
            }
        }

        let persisted = match read_index(&self.paths.index) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Could not read vector index, rebuilding");
                return Err(LoadOutcome::RebuiltInvalid);
            }
        };

        if persisted.dimension != self.embedder.dimension() {
            warn!(
                index = persisted.dimension,
                model = self.embedder.dimension(),
                "Dimension mismatch, rebuilding vector index"
            );
            return Err(LoadOutcome::RebuiltDimensionMismatch);
        }

        let chunks = match read_chunks(&self.paths.chunks) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Could not read side table, rebuilding");
                return Err(LoadOutcome::RebuiltInvalid);
            }
        };

        let rows_ok = persisted.version == FORMAT_VERSION
            && persisted.dimension > 0
            && persisted.vectors.len() == persisted.keys.len() * persisted.dimension;
        let keys_match = persisted.keys.len() == chunks.len()
            && persisted.keys.iter().zip(&chunks).all(|(k, c)| *k == c.key);
        if !rows_ok || !keys_match {
            warn!(
                index_rows = persisted.keys.len(),
                side_table = chunks.len(),
                "Vector index and side table disagree, rebuilding"
            );
            return Err(LoadOutcome::RebuiltInvalid);
        }

        self.matrix = Matrix {
            dimension: persisted.dimension,
            data: persisted.vectors,
        };
        self.chunks = chunks;
        Ok(())
    }

    /// Replace the whole index with `chunks`, re-embedding every text.
    ///
    /// Both artifacts are written before the in-memory state is swapped, so a
    /// failed build leaves the live index untouched.
    pub fn build(&mut self, chunks: Vec<IndexedChunk>) -> Result<(), MemoryError> {
        info!(chunks = chunks.len(), "Building vector index");

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = self.embedder.embed_documents(&texts);

        let mut matrix = Matrix::new(self.embedder.dimension());
        for v in vectors {
            matrix.push(v);
        }

        write_artifacts(&self.paths, &chunks, &matrix)?;

        self.chunks = chunks;
        self.matrix = matrix;
        debug_assert!(self.is_aligned());

        if self.chunks.is_empty() {
            warn!("Vector index built with no chunks");
        } else {
            info!(chunks = self.chunks.len(), "Built vector index");
        }
        Ok(())
    }

    /// Embed and append one chunk, then persist both artifacts.
    pub fn append(&mut self, chunk: IndexedChunk) -> Result<(), MemoryError> {
        self.append_batch(vec![chunk])
    }

    /// Embed and append several chunks with a single persist.
    ///
    /// If persisting fails the in-memory append is rolled back.
    pub fn append_batch(&mut self, chunks: Vec<IndexedChunk>) -> Result<(), MemoryError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = self.embedder.embed_documents(&texts);

        let before = self.chunks.len();
        for (chunk, v) in chunks.into_iter().zip(vectors) {
            self.matrix.push(v);
            self.chunks.push(chunk);
        }

        if let Err(e) = write_artifacts(&self.paths, &self.chunks, &self.matrix) {
            self.chunks.truncate(before);
            self.matrix.truncate(before);
            warn!(error = %e, "Vector index append not persisted, rolled back");
            return Err(e);
        }

        debug!(
            added = self.chunks.len() - before,
            total = self.chunks.len(),
            "Appended to vector index"
        );
        Ok(())
    }

    /// The `k` chunks most similar to `query`, best first.
    pub fn search(&self, query: &str, k: usize) -> Vec<ScoredChunk> {
        if k == 0 || self.chunks.is_empty() {
            return Vec::new();
        }

        let mut q = self.embedder.embed_query(query);
        normalize(&mut q);

        let hits = self.matrix.top_k(&q, k);
        debug!(k, found = hits.len(), "Semantic search");

        hits.into_iter()
            .map(|(i, score)| {
                let chunk = &self.chunks[i];
                ScoredChunk {
                    key: chunk.key.clone(),
                    source: chunk.source.clone(),
                    text: chunk.text.clone(),
                    score,
                }
            })
            .collect()
    }

    /// Drop every chunk matching `predicate` and rebuild from the survivors.
    ///
    /// Returns the number of chunks removed. Nothing is rebuilt when nothing matches.
    pub fn remove_and_rebuild<P>(&mut self, predicate: P) -> Result<usize, MemoryError>
    where
        P: Fn(&IndexedChunk) -> bool,
    {
        let (removed, kept): (Vec<_>, Vec<_>) =
            self.chunks.iter().cloned().partition(|c| predicate(c));
        if removed.is_empty() {
            return Ok(0);
        }
        self.build(kept)?;
        Ok(removed.len())
    }

    pub fn chunks(&self) -> &[IndexedChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.matrix.dimension
    }

    /// Number of vector rows.
    pub fn row_count(&self) -> usize {
        self.matrix.rows()
    }

    /// Side table and matrix have the same number of rows.
    pub fn is_aligned(&self) -> bool {
        self.chunks.len() == self.matrix.rows()
    }

    /// Sizes in bytes of (index artifact, side table), if present on disk.
    pub fn artifact_sizes(&self) -> (Option<u64>, Option<u64>) {
        let size = |p: &Path| fs::metadata(p).ok().map(|m| m.len());
        (size(&self.paths.index), size(&self.paths.chunks))
    }
}

fn read_index(path: &Path) -> Result<PersistedIndex, MemoryError> {
    let bytes = fs::read(path)?;
    Ok(bincode::deserialize(&bytes)?)
}

fn read_chunks(path: &Path) -> Result<Vec<IndexedChunk>, MemoryError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write the side table, then the index. Each goes through a temp file and rename.
fn write_artifacts(
    paths: &IndexPaths,
    chunks: &[IndexedChunk],
    matrix: &Matrix,
) -> Result<(), MemoryError> {
    let persisted = PersistedIndex {
        version: FORMAT_VERSION,
        dimension: matrix.dimension,
        keys: chunks.iter().map(|c| c.key.clone()).collect(),
        vectors: matrix.data.clone(),
    };

    write_atomic(&paths.dir, &paths.chunks, &serde_json::to_vec(chunks)?)?;
    write_atomic(&paths.dir, &paths.index, &bincode::serialize(&persisted)?)?;
    Ok(())
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), MemoryError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use tempfile::TempDir;

    fn embedder(dim: usize) -> Arc<dyn Embedder> {
        Arc::new(HashEmbedder::new(dim))
    }

    fn corpus() -> Vec<IndexedChunk> {
        vec![
            IndexedChunk::new("episode:1", "episode/a.txt", "We hiked up the mountain at dawn"),
            IndexedChunk::new("episode:2", "episode/a.txt", "Cooking pasta with fresh basil"),
            IndexedChunk::new("lore/self", "lore/self", "I enjoy long conversations about books"),
        ]
    }

    fn open(dir: &TempDir, dim: usize, chunks: Vec<IndexedChunk>) -> (VectorIndex, LoadOutcome) {
        VectorIndex::load_or_build(dir.path(), embedder(dim), move || Ok(chunks)).unwrap()
    }

    #[test]
    fn test_builds_fresh_when_missing() {
        let dir = TempDir::new().unwrap();
        let (index, outcome) = open(&dir, 64, corpus());

        assert_eq!(outcome, LoadOutcome::BuiltFresh);
        assert_eq!(index.len(), 3);
        assert!(index.is_aligned());
        assert!(dir.path().join(INDEX_FILE).exists());
        assert!(dir.path().join(CHUNKS_FILE).exists());
    }

    #[test]
    fn test_exact_text_ranks_first() {
        let dir = TempDir::new().unwrap();
        let (index, _) = open(&dir, 256, corpus());

        let hits = index.search("Cooking pasta with fresh basil", 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].key, "episode:2");
        assert!((hits[0].score - 1.0).abs() < 1e-4);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_search_fewer_than_k() {
        let dir = TempDir::new().unwrap();
        let (index, _) = open(&dir, 64, corpus());

        assert_eq!(index.search("mountain", 10).len(), 3);
        assert!(index.search("mountain", 0).is_empty());

        let empty_dir = TempDir::new().unwrap();
        let (empty, _) = open(&empty_dir, 64, vec![]);
        assert!(empty.search("anything", 5).is_empty());
    }

    #[test]
    fn test_search_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let (index, _) = open(&dir, 64, corpus());
        assert_eq!(index.search("books and basil", 3), index.search("books and basil", 3));
    }

    #[test]
    fn test_append_round_trip_and_alignment() {
        let dir = TempDir::new().unwrap();
        let (mut index, _) = open(&dir, 256, corpus());

        index
            .append(IndexedChunk::new(
                "episode:9",
                "episode/cycle_007",
                "She laughed at the lighthouse joke",
            ))
            .unwrap();

        assert_eq!(index.len(), 4);
        assert_eq!(index.row_count(), 4);
        assert!(index.is_aligned());

        let hits = index.search("She laughed at the lighthouse joke", 1);
        assert_eq!(hits[0].key, "episode:9");
        assert_eq!(hits[0].source, "episode/cycle_007");
    }

    #[test]
    fn test_reload_after_append() {
        let dir = TempDir::new().unwrap();
        {
            let (mut index, _) = open(&dir, 64, corpus());
            index
                .append(IndexedChunk::new("episode:4", "episode/x", "A brand new memory"))
                .unwrap();
        }

        let (index, outcome) =
            VectorIndex::load_or_build(dir.path(), embedder(64), || panic!("should not rebuild"))
                .unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(index.len(), 4);
        assert!(index.is_aligned());
        assert_eq!(index.chunks()[3].text, "A brand new memory");
    }

    #[test]
    fn test_dimension_mismatch_rebuilds() {
        let dir = TempDir::new().unwrap();
        open(&dir, 64, corpus());

        let (index, outcome) = open(&dir, 128, corpus());
        assert_eq!(outcome, LoadOutcome::RebuiltDimensionMismatch);
        assert_eq!(index.dimension(), 128);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_partial_artifacts_rebuild() {
        let dir = TempDir::new().unwrap();
        open(&dir, 64, corpus());
        fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let (index, outcome) = open(&dir, 64, corpus());
        assert_eq!(outcome, LoadOutcome::RebuiltInvalid);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_mismatched_side_table_rebuilds() {
        let dir = TempDir::new().unwrap();
        open(&dir, 64, corpus());

        // Simulate a crash between the two writes: side table has an extra entry
        let mut chunks = corpus();
        chunks.push(IndexedChunk::new("episode:5", "episode/x", "orphan"));
        fs::write(dir.path().join(CHUNKS_FILE), serde_json::to_vec(&chunks).unwrap()).unwrap();

        let (index, outcome) = open(&dir, 64, corpus());
        assert_eq!(outcome, LoadOutcome::RebuiltInvalid);
        assert_eq!(index.len(), 3);
        assert!(index.is_aligned());
    }

    #[test]
    fn test_corrupt_index_rebuilds() {
        let dir = TempDir::new().unwrap();
        open(&dir, 64, corpus());
        fs::write(dir.path().join(INDEX_FILE), b"not bincode").unwrap();

        let (_, outcome) = open(&dir, 64, corpus());
        assert_eq!(outcome, LoadOutcome::RebuiltInvalid);
    }

    #[test]
    fn test_remove_and_rebuild() {
        let dir = TempDir::new().unwrap();
        let (mut index, _) = open(&dir, 256, corpus());

        let removed = index.remove_and_rebuild(|c| c.key == "episode:1").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(index.len(), 2);
        assert!(index.is_aligned());
        assert!(index
            .search("We hiked up the mountain at dawn", 5)
            .iter()
            .all(|h| h.key != "episode:1"));

        assert_eq!(index.remove_and_rebuild(|c| c.key == "missing").unwrap(), 0);
    }

    #[test]
    fn test_failed_persist_leaves_index_unchanged() {
        let dir = TempDir::new().unwrap();
        let index_dir = dir.path().join("index");
        let (mut index, _) =
            VectorIndex::load_or_build(&index_dir, embedder(64), || Ok(corpus())).unwrap();

        // Replace the directory with a plain file so temp files cannot be created
        fs::remove_dir_all(&index_dir).unwrap();
        fs::write(&index_dir, b"").unwrap();

        let err = index.append(IndexedChunk::new("episode:7", "episode/x", "lost"));
        assert!(err.is_err());
        assert_eq!(index.len(), 3);
        assert!(index.is_aligned());

        assert!(index.remove_and_rebuild(|c| c.key == "episode:1").is_err());
        assert_eq!(index.len(), 3);
        assert!(index.is_aligned());
    }
}
