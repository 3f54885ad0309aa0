//! Keyword search over the episodic store (SQLite FTS5).

use rusqlite::{params, Connection, ErrorCode};
use tracing::debug;

use crate::error::MemoryError;

/// Words ignored when building a keyword query.
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "when", "at", "by", "for", "from",
    "in", "into", "of", "off", "on", "onto", "to", "with", "is", "are", "was", "were", "be",
    "been", "being", "have", "has", "had", "do", "does", "did", "can", "could", "will", "would",
    "should", "may", "might", "must", "i", "you", "he", "she", "it", "we", "they", "my", "your",
    "his", "her", "its", "our", "their", "me", "him", "us", "them", "what", "which", "who",
    "whom", "this", "that", "these", "those", "am", "remember",
];

fn is_stop_word(token: &str) -> bool {
    let lower = token.to_lowercase();
    STOP_WORDS.contains(&lower.as_str())
}

/// Build a disjunctive FTS5 match expression from a natural-language query.
///
/// Quote characters are stripped, every remaining token is quoted, and tokens
/// are joined with `OR` so that any single hit surfaces a fragment. If every
/// token is a stop word the unfiltered token list is used instead.
/// Returns `None` when the query has no tokens at all.
pub(crate) fn build_match_query(query: &str) -> Option<String> {
    let sanitized = query.replace(['"', '\''], "");
    let all: Vec<&str> = sanitized.split_whitespace().collect();
    if all.is_empty() {
        return None;
    }

    let filtered: Vec<&str> = all.iter().copied().filter(|t| !is_stop_word(t)).collect();
    let tokens = if filtered.is_empty() { all } else { filtered };

    Some(
        tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Run a keyword search and return matching fragment contents, best first.
///
/// FTS5 rejecting the match expression is treated as "no results".
pub(crate) fn fts_search(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> Result<Vec<String>, MemoryError> {
    let Some(match_query) = build_match_query(query) else {
        return Ok(vec![]);
    };
    if limit == 0 {
        return Ok(vec![]);
    }

    // bm25() is negative, more negative = better match
    let mut stmt = conn.prepare(
        "SELECT f.content FROM fragments_fts
         JOIN fragments f ON f.id = fragments_fts.rowid
         WHERE fragments_fts MATCH ?1
         ORDER BY bm25(fragments_fts), f.id
         LIMIT ?2",
    )?;

    // Syntax errors surface when the statement is stepped, not at prepare time
    let results: Result<Vec<String>, rusqlite::Error> = stmt
        .query_map(params![match_query, limit as i64], |row| row.get(0))
        .and_then(|rows| rows.collect());

    match results {
        Ok(results) => {
            debug!(
                query = %truncate_for_log(query),
                found = results.len(),
                "Episodic search"
            );
            Ok(results)
        }
        Err(e) if is_query_syntax_error(&e) => {
            debug!(query = %truncate_for_log(query), error = %e, "Keyword query rejected");
            Ok(vec![])
        }
        Err(e) => Err(e.into()),
    }
}

/// A malformed MATCH expression: SQLITE_ERROR with an `fts5:` message.
///
/// Other SQLITE_ERRORs (missing tables, broken schema) are real faults.
fn is_query_syntax_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, Some(msg))
            if err.code == ErrorCode::Unknown && msg.starts_with("fts5:")
    )
}

fn truncate_for_log(s: &str) -> &str {
    match s.char_indices().nth(50) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
