//! Per-process memory context.

use std::sync::Arc;

use tracing::info;

use crate::config::MemoryConfig;
use crate::embedder::{select_embedder, Embedder};
use crate::error::MemoryError;
use crate::orchestrator::MemoryOrchestrator;
use crate::proximity::ProximityClassifier;

/// Everything a conversation loop needs, built around one shared embedder.
///
/// Only one process may use a given `db_path` / `index_dir` pair at a time.
/// Nothing locks the files; a second process writing the same artifacts
/// will corrupt the alignment between the vector index and its side table.
pub struct MemoryContext {
    pub memory: MemoryOrchestrator,
    pub proximity: ProximityClassifier,
    embedder: Arc<dyn Embedder>,
}

impl MemoryContext {
    /// Select the embedding backend from `config` and open both components.
    pub fn open(config: MemoryConfig) -> Result<Self, MemoryError> {
        config.validate()?;
        let embedder = select_embedder(&config.embedding);
        Self::with_embedder(config, embedder)
    }

    /// Open with an explicit embedder.
    pub fn with_embedder(
        config: MemoryConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, MemoryError> {
        let proximity = ProximityClassifier::new(embedder.clone(), config.proximity.clone());
        let memory = MemoryOrchestrator::open(config, embedder.clone())?;

        info!(
            embedder = embedder.name(),
            dimension = embedder.dimension(),
            "Memory context ready"
        );
        Ok(Self {
            memory,
            proximity,
            embedder,
        })
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingBackend;
    use crate::proximity::ProximityState;
    use tempfile::TempDir;

    #[test]
    fn test_open_shares_embedder() {
        let dir = TempDir::new().unwrap();
        let mut config = MemoryConfig::in_dir(dir.path());
        config.embedding.backend = EmbeddingBackend::Hash;
        config.embedding.dimension = 32;

        let ctx = MemoryContext::open(config).unwrap();
        assert_eq!(ctx.embedder().dimension(), 32);
        assert_eq!(ctx.memory.index().dimension(), 32);
        assert_eq!(ctx.proximity.current_state(), ProximityState::Remote);
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = MemoryConfig::in_dir(dir.path());
        config.embedding.dimension = 0;
        assert!(matches!(
            MemoryContext::open(config),
            Err(MemoryError::Config(_))
        ));
    }
}
