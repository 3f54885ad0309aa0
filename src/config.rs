//! Runtime configuration.
//!
//! Every field has a default so a partial TOML file (or none at all) works.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::db::default_data_dir;
use crate::error::MemoryError;
use crate::{
    CONFIDENCE_THRESHOLD, DEFAULT_DIMENSION, DEFAULT_EPISODIC_LIMIT, DEFAULT_SEMANTIC_LIMIT,
    DEFAULT_LORE_LIMIT, EPISODIC_KEEP, MAX_BULLET_LEN, REBUILD_SCAN_LIMIT, SEMANTIC_KEEP,
    SHORT_TURN_CHARS,
};

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Use the model backend if compiled in and loadable, otherwise hash.
    #[default]
    Auto,
    /// Always use the deterministic hash embedder.
    Hash,
    /// Require the model backend; still degrades to hash (with a warning) if unavailable.
    Fastembed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// Model name understood by the model backend.
    pub model: String,
    /// Vector dimension. Must match the model when the model backend is used.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Auto,
            model: "nomic-embed-text-v1.5".into(),
            dimension: DEFAULT_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Keyword results requested from the episodic store.
    pub episodic_limit: usize,
    /// Nearest neighbours requested from the vector index.
    pub semantic_limit: usize,
    /// Semantic results kept in the rendered block.
    pub semantic_keep: usize,
    /// Episodic results kept in the rendered block (after dedup).
    pub episodic_keep: usize,
    /// Maximum characters per rendered bullet before truncation.
    pub max_bullet_len: usize,
    /// Maximum episodic rows scanned when rebuilding the vector index.
    pub rebuild_scan_limit: usize,
    /// Lore bullets returned by `lore_section`.
    pub lore_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            episodic_limit: DEFAULT_EPISODIC_LIMIT,
            semantic_limit: DEFAULT_SEMANTIC_LIMIT,
            semantic_keep: SEMANTIC_KEEP,
            episodic_keep: EPISODIC_KEEP,
            max_bullet_len: MAX_BULLET_LEN,
            rebuild_scan_limit: REBUILD_SCAN_LIMIT,
            lore_limit: DEFAULT_LORE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Best-anchor similarity must be strictly above this to change state.
    pub threshold: f32,
    /// Turns shorter than this many characters are blended with the prior turn.
    pub short_turn_chars: usize,
    /// Emit an `info` event whenever a low-confidence turn is ignored.
    pub log_skipped_transitions: bool,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            threshold: CONFIDENCE_THRESHOLD,
            short_turn_chars: SHORT_TURN_CHARS,
            log_skipped_transitions: false,
        }
    }
}

/// A text file folded into the vector index on every rebuild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSource {
    /// Source tag, e.g. `lore/self`. Also the side-table key when not chunked.
    pub key: String,
    pub path: PathBuf,
    /// Split into paragraph chunks keyed `<key>#<n>` instead of one whole-file chunk.
    #[serde(default)]
    pub chunked: bool,
}

impl FileSource {
    /// A file indexed as one chunk.
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            chunked: false,
        }
    }

    /// A file split into paragraph chunks.
    pub fn chunked(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            chunked: true,
            ..Self::new(key, path)
        }
    }
}

/// Top-level configuration for the memory system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// SQLite database backing the episodic store.
    pub db_path: PathBuf,
    /// Directory holding `semantic.index` and `semantic_chunks.json`.
    pub index_dir: PathBuf,
    /// Lore and semantic-memory files folded into every rebuild.
    pub file_sources: Vec<FileSource>,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub proximity: ProximityConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::in_dir(default_data_dir())
    }
}

impl MemoryConfig {
    /// Configuration with every artifact placed under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            db_path: dir.join("brain.db"),
            index_dir: dir.join("index"),
            file_sources: vec![
                FileSource::chunked("lore/self", dir.join("lore/self.md")),
                FileSource::chunked("lore/user", dir.join("lore/user.md")),
                FileSource::chunked("lore/relationship", dir.join("lore/relationship.md")),
                FileSource::new("semantic/memory", dir.join("semantic/memory.md")),
            ],
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            proximity: ProximityConfig::default(),
        }
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, MemoryError> {
        let config: MemoryConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.embedding.dimension == 0 {
            return Err(MemoryError::Config(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.proximity.threshold) {
            return Err(MemoryError::Config(format!(
                "proximity.threshold must be a cosine similarity in [-1, 1] (got {})",
                self.proximity.threshold
            )));
        }
        if self.retrieval.max_bullet_len == 0 {
            return Err(MemoryError::Config(
                "retrieval.max_bullet_len must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::in_dir("/tmp/mem");
        assert_eq!(config.db_path, PathBuf::from("/tmp/mem/brain.db"));
        assert_eq!(config.index_dir, PathBuf::from("/tmp/mem/index"));
        assert_eq!(config.file_sources.len(), 4);
        assert!(config.file_sources[..3].iter().all(|f| f.chunked));
        assert!(!config.file_sources[3].chunked);
        assert_eq!(config.embedding.dimension, 768);
        assert_eq!(config.retrieval.semantic_keep, 3);
        assert_eq!(config.retrieval.episodic_keep, 2);
        assert!((config.proximity.threshold - 0.45).abs() < f32::EPSILON);
        assert!(!config.proximity.log_skipped_transitions);
    }

    #[test]
    fn test_partial_toml() {
        let config = MemoryConfig::from_toml_str(
            r#"
            db_path = "/var/lib/mem/brain.db"

            [embedding]
            backend = "hash"
            dimension = 256

            [proximity]
            log_skipped_transitions = true
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/var/lib/mem/brain.db"));
        assert_eq!(config.embedding.backend, EmbeddingBackend::Hash);
        assert_eq!(config.embedding.dimension, 256);
        assert_eq!(config.embedding.model, "nomic-embed-text-v1.5");
        assert!(config.proximity.log_skipped_transitions);
        assert_eq!(config.retrieval.max_bullet_len, 150);
    }

    #[test]
    fn test_file_sources_from_toml() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [[file_sources]]
            key = "lore/self"
            path = "/srv/lore/self.md"
            chunked = true

            [[file_sources]]
            key = "semantic/memory"
            path = "/srv/semantic/memory.md"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.file_sources,
            vec![
                FileSource::chunked("lore/self", "/srv/lore/self.md"),
                FileSource::new("semantic/memory", "/srv/semantic/memory.md"),
            ]
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = MemoryConfig::from_toml_str("[embedding]\ndimension = 0\n").unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));

        let err = MemoryConfig::from_toml_str("[proximity]\nthreshold = 2.0\n").unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));

        let err = MemoryConfig::from_toml_str("db_path = 3").unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }
}
