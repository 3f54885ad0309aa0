//! End-to-end scenarios for the memory context.
//!
//! Everything runs on the hash embedder against a temporary data directory.

use std::fs;

use companion_memory::{
    AnchorScores, DeleteOutcome, EmbeddingBackend, EpisodicStore, IndexStatus, LoadOutcome,
    MemoryConfig, MemoryContext, ProximityState, LORE_FALLBACK, NOTHING_RETRIEVED,
};
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> MemoryConfig {
    let mut config = MemoryConfig::in_dir(dir.path());
    config.embedding.backend = EmbeddingBackend::Hash;
    config.embedding.dimension = 128;
    config
}

#[test]
fn test_ingest_and_keyword_search() {
    let mut store = EpisodicStore::open_in_memory().unwrap();
    assert_eq!(store.ingest("A.\n---\nB.\n---\n", "notes.txt").unwrap(), 2);
    assert_eq!(store.search("B", 5).unwrap(), vec!["B.".to_string()]);
}

#[test]
fn test_empty_corpus_retrieves_sentinel() {
    let dir = TempDir::new().unwrap();
    let ctx = MemoryContext::open(test_config(&dir)).unwrap();
    assert_eq!(ctx.memory.retrieve("hello", 3, 5).unwrap(), NOTHING_RETRIEVED);
}

#[test]
fn test_commit_is_rank_one_for_exact_text() {
    let dir = TempDir::new().unwrap();
    let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();

    ctx.memory.commit_fragment("We baked bread on Sunday.", "summary").unwrap();
    let receipt = ctx
        .memory
        .commit_fragment("The user's sister is visiting in March.", "summary")
        .unwrap();
    ctx.memory.commit_fragment("Talked about favourite films.", "summary").unwrap();

    let hits = ctx
        .memory
        .index()
        .search("The user's sister is visiting in March.", 3);
    assert_eq!(hits[0].key, receipt.chunk_key);
    assert!(hits[0].score > 0.99);
    assert!(ctx.memory.index().is_aligned());
}

#[test]
fn test_delete_removes_from_both_stores() {
    let dir = TempDir::new().unwrap();
    let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();

    let target = ctx
        .memory
        .commit_fragment("Secret plans for the surprise party.", "summary")
        .unwrap();
    ctx.memory.commit_fragment("Walked the dog by the river.", "summary").unwrap();

    let outcome = ctx.memory.delete_fragment(target.record.id).unwrap();
    assert!(matches!(outcome, DeleteOutcome::Deleted { removed_chunks: 1, .. }));

    assert!(ctx.memory.store().search("surprise party", 5).unwrap().is_empty());
    let hits = ctx.memory.index().search("Secret plans for the surprise party.", 5);
    assert!(hits.iter().all(|h| !h.text.contains("surprise")));

    let block = ctx
        .memory
        .memory_section("do you remember the surprise party?")
        .unwrap()
        .unwrap();
    assert!(!block.contains("surprise"));
    assert_eq!(ctx.memory.status(), IndexStatus::Consistent);
}

#[test]
fn test_delete_survives_restart() {
    let dir = TempDir::new().unwrap();
    let id = {
        let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();
        let receipt = ctx.memory.commit_fragment("Forget this one.", "summary").unwrap();
        ctx.memory.commit_fragment("Keep this one.", "summary").unwrap();
        let outcome = ctx.memory.delete_fragment(receipt.record.id).unwrap();
        assert!(outcome.is_consistent());
        receipt.record.id
    };

    let ctx = MemoryContext::open(test_config(&dir)).unwrap();
    assert_eq!(ctx.memory.load_outcome(), LoadOutcome::Loaded);
    assert!(ctx.memory.store().get(id).unwrap().is_none());
    let texts: Vec<&str> = ctx.memory.index().chunks().iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["Keep this one."]);
}

#[test]
fn test_partial_artifacts_trigger_rebuild() {
    let dir = TempDir::new().unwrap();
    {
        let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();
        ctx.memory.commit_fragment("Rebuilt from the episodic store.", "summary").unwrap();
    }
    fs::remove_file(dir.path().join("index/semantic.index")).unwrap();

    let ctx = MemoryContext::open(test_config(&dir)).unwrap();
    assert_eq!(ctx.memory.load_outcome(), LoadOutcome::RebuiltInvalid);
    assert_eq!(ctx.memory.index().len(), 1);
    assert_eq!(ctx.memory.index().chunks()[0].key, "episode:1");
}

#[test]
fn test_dimension_change_triggers_rebuild() {
    let dir = TempDir::new().unwrap();
    {
        let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();
        ctx.memory.commit_fragment("Indexed at one dimension.", "summary").unwrap();
    }

    let mut config = test_config(&dir);
    config.embedding.dimension = 64;
    let ctx = MemoryContext::open(config).unwrap();
    assert_eq!(ctx.memory.load_outcome(), LoadOutcome::RebuiltDimensionMismatch);
    assert_eq!(ctx.memory.index().dimension(), 64);
    assert_eq!(ctx.memory.index().len(), 1);
}

#[test]
fn test_lore_and_semantic_memory_files() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("lore")).unwrap();
    fs::create_dir_all(dir.path().join("semantic")).unwrap();
    fs::write(dir.path().join("lore/user.md"), "The user plays the cello.").unwrap();
    fs::write(dir.path().join("semantic/memory.md"), "Prefers tea over coffee.").unwrap();

    let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();
    let keys: Vec<&str> = ctx.memory.index().chunks().iter().map(|c| c.key.as_str()).collect();
    assert_eq!(keys, vec!["lore/user#0", "semantic/memory"]);

    // Edited lore is picked up by the next rebuild
    fs::write(dir.path().join("lore/user.md"), "The user plays the violin.").unwrap();
    assert_eq!(ctx.memory.rebuild().unwrap(), 2);
    assert_eq!(ctx.memory.index().chunks()[0].text, "The user plays the violin.");
}

#[test]
fn test_relevant_lore_skips_episodes() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("lore")).unwrap();
    fs::write(
        dir.path().join("lore/relationship.md"),
        "We met at a bookshop.\n\nWe argue about poetry.",
    )
    .unwrap();

    let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();
    ctx.memory.commit_fragment("We met at a bookshop.", "summary").unwrap();

    let block = ctx.memory.relevant_lore("We met at a bookshop.");
    assert_eq!(block, "- We met at a bookshop.\n- We argue about poetry.");
    assert_ne!(block, LORE_FALLBACK);
}

#[test]
fn test_import_then_stats() {
    let dir = TempDir::new().unwrap();
    let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();

    let file = dir.path().join("journal.txt");
    fs::write(&file, "Monday was rainy.\n---\nTuesday we cooked curry.\n---\n\n---\n").unwrap();
    assert_eq!(ctx.memory.import_file(&file).unwrap(), 2);
    ctx.memory.commit_fragment("Wednesday was quiet.", "summary").unwrap();

    let stats = ctx.memory.stats().unwrap();
    assert_eq!(stats.episodic_count, 3);
    assert_eq!(stats.indexed_chunks, 3);
    let sources: Vec<(&str, i64)> = stats
        .sources
        .iter()
        .map(|s| (s.source.as_str(), s.count))
        .collect();
    assert_eq!(sources, vec![("journal.txt", 2), ("summary", 1)]);
}

#[test]
fn test_proximity_session() {
    let dir = TempDir::new().unwrap();
    let mut ctx = MemoryContext::open(test_config(&dir)).unwrap();

    let first = ctx.proximity.emission_block(true).unwrap();
    assert!(first.contains("messages"));
    assert!(ctx.proximity.emission_block(false).is_none());

    let d = ctx.proximity.resolve_scores(AnchorScores([0.1, 0.2, 0.1, 0.7]));
    assert_eq!(d.state, ProximityState::Physical);
    assert!(d.changed);
    assert!(ctx.proximity.emission_block(false).is_some());
    assert!(ctx.proximity.emission_block(false).is_none());

    // Threshold boundary: exactly at the threshold never moves the state
    let d = ctx.proximity.resolve_scores(AnchorScores([0.0, 0.45, 0.0, 0.0]));
    assert!(!d.changed);
    let d = ctx.proximity.resolve_scores(AnchorScores([0.0, 0.46, 0.0, 0.0]));
    assert!(d.changed);
    assert_eq!(d.state, ProximityState::Remote);
}
