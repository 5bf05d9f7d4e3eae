//! Short-term context tier: a per-user log of recent turns

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::{EmbedKind, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::message::{stamp_summary, ContextEntry, Role};
use crate::storage::{RecordMetadata, SqliteStorage, Tier, VectorIndex};

/// One turn of the recent window, as it should be echoed into a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentTurn {
    pub role: Role,
    pub text: String,
}

/// A context turn found by semantic search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMatch {
    /// Row id; later turns have larger ids
    pub row_id: i64,
    pub role: Role,
    /// Stamped summary
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub score: f32,
}

/// Short-term memory store.
///
/// Every appended turn gets a relational row and one vector record built
/// from its summary; the two are removed together by [`clear`](Self::clear).
#[derive(Clone)]
pub struct ContextStore {
    sqlite: SqliteStorage,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl ContextStore {
    pub fn new(
        sqlite: SqliteStorage,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            sqlite,
            index,
            embedder,
        }
    }

    /// Record a turn now
    pub async fn append(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: &str,
    ) -> Result<ContextEntry> {
        self.append_at(user_id, role, content, summary, Utc::now())
            .await
    }

    /// Record a turn at a given moment.
    ///
    /// The stored summary is prefixed with a readable stamp; the embedding
    /// is taken from the bare summary (or the content when the summary is
    /// blank).
    pub async fn append_at(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: &str,
        at: DateTime<Utc>,
    ) -> Result<ContextEntry> {
        let basis = if summary.trim().is_empty() { content } else { summary };
        let embedding = self
            .embedder
            .embed(basis, EmbedKind::Passage)
            .await?
            .ok_or_else(|| Error::invalid_input("Cannot store an empty turn"))?;

        let stamped = stamp_summary(at, basis);
        let entry = self
            .sqlite
            .insert_context(user_id, role, content, &stamped, at)?;

        if let Err(e) = self.index.add(embedding, context_metadata(&entry)) {
            if let Err(rollback) = self.sqlite.delete_context_row(entry.id) {
                warn!(user_id, error = %rollback, "Failed to roll back context row");
            }
            return Err(e);
        }

        debug!(user_id, role = %role, id = entry.id, "Appended context turn");
        Ok(entry)
    }

    /// The last `limit` turns, oldest first.
    ///
    /// The newest user-authored turn is returned verbatim; every other turn
    /// uses its summary.
    pub fn recent_window(&self, user_id: &str, limit: usize) -> Result<Vec<RecentTurn>> {
        let entries = self.sqlite.recent_context(user_id, limit)?;
        let latest_user = entries.iter().rposition(|e| e.role == Role::User);

        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| RecentTurn {
                role: entry.role,
                text: if Some(i) == latest_user {
                    entry.content
                } else {
                    entry.summary
                },
            })
            .collect())
    }

    /// Context turns of this user semantically close to `query`, best first
    pub async fn semantic_match(
        &self,
        user_id: &str,
        query: &str,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<ContextMatch>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let Some(query_embedding) = self.embedder.embed(query, EmbedKind::Query).await? else {
            return Ok(Vec::new());
        };

        let hits = self.index.search_where(&query_embedding, top_k, threshold, |m| {
            m.belongs_to(user_id, Tier::Context)
        })?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                let timestamp = hit.metadata.timestamp?;
                Some(ContextMatch {
                    row_id: hit.metadata.row_id,
                    role: hit.metadata.role,
                    summary: hit.metadata.summary,
                    timestamp,
                    score: hit.score,
                })
            })
            .collect())
    }

    /// Every context turn of a user
    pub fn dump_all(&self, user_id: &str) -> Result<Vec<ContextEntry>> {
        self.sqlite.full_context(user_id)
    }

    /// Drop a user's whole context: rows first, then vector records
    pub fn clear(&self, user_id: &str) -> Result<usize> {
        let rows = self.sqlite.delete_context(user_id)?;
        let vectors = self
            .index
            .delete(|m| m.belongs_to(user_id, Tier::Context))?;
        if rows != vectors {
            warn!(user_id, rows, vectors, "Context rows and vector records diverged before clear");
        }
        debug!(user_id, rows, "Cleared context");
        Ok(rows)
    }

    /// Drop only the listed context turns of a user.
    ///
    /// Turns appended after `ids` was collected are left in place.
    pub fn clear_entries(&self, user_id: &str, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let rows = self.sqlite.delete_context_rows(user_id, ids)?;
        let vectors = self
            .index
            .delete(|m| m.belongs_to(user_id, Tier::Context) && ids.contains(&m.row_id))?;
        if rows != vectors {
            warn!(user_id, rows, vectors, "Context rows and vector records diverged before clear");
        }
        debug!(user_id, rows, "Cleared examined context");
        Ok(rows)
    }
}

/// Vector metadata mirroring a context row
pub(crate) fn context_metadata(entry: &ContextEntry) -> RecordMetadata {
    RecordMetadata {
        user_id: entry.user_id.clone(),
        tier: Tier::Context,
        row_id: entry.id,
        role: entry.role,
        content: entry.content.clone(),
        summary: entry.summary.clone(),
        timestamp: Some(entry.timestamp),
        date: None,
        rate: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashingEmbedder;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> (ContextStore, Arc<VectorIndex>) {
        let config = Config {
            embedding_dimensions: 64,
            ..Config::with_data_dir(dir.path())
        };
        let sqlite = SqliteStorage::new(&config).unwrap();
        let index = Arc::new(VectorIndex::open(&config).unwrap());
        let embedder = Arc::new(HashingEmbedder::new(64));
        (ContextStore::new(sqlite, index.clone(), embedder), index)
    }

    #[tokio::test]
    async fn latest_user_turn_is_echoed_verbatim() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        store.append_at("u", Role::User, "hi", "hi", start).await.unwrap();
        store
            .append_at("u", Role::Assistant, "hey", "hey", start + Duration::seconds(1))
            .await
            .unwrap();
        store
            .append_at("u", Role::User, "I love cats", "likes cats", start + Duration::seconds(2))
            .await
            .unwrap();

        let window = store.recent_window("u", 3).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(
            window[2],
            RecentTurn {
                role: Role::User,
                text: "I love cats".to_string()
            }
        );
        assert_eq!(window[0].text, "[01.05 10:00]hi");
        assert_eq!(window[1].text, "[01.05 10:00]hey");
    }

    #[tokio::test]
    async fn only_the_newest_user_turn_keeps_raw_content() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        store.append_at("u", Role::User, "raw one", "one", start).await.unwrap();
        store
            .append_at("u", Role::User, "raw two", "two", start + Duration::seconds(1))
            .await
            .unwrap();
        store
            .append_at("u", Role::Assistant, "raw reply", "reply", start + Duration::seconds(2))
            .await
            .unwrap();

        let texts: Vec<_> = store
            .recent_window("u", 10)
            .unwrap()
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(texts, vec!["[01.05 10:00]one", "raw two", "[01.05 10:00]reply"]);
    }

    #[tokio::test]
    async fn semantic_match_is_scoped_to_user() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        store.append("a", Role::User, "my cat is orange", "cat is orange").await.unwrap();
        store.append("b", Role::User, "my cat is grey", "cat is grey").await.unwrap();

        let matches = store.semantic_match("a", "cat", 0.0, 10).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].summary.ends_with("cat is orange"));
    }

    #[tokio::test]
    async fn blank_query_matches_nothing() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store(&dir);
        store.append("a", Role::User, "hello", "hello").await.unwrap();
        assert!(store.semantic_match("a", "  ", 0.0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_removes_rows_and_vectors_for_one_user() {
        let dir = TempDir::new().unwrap();
        let (store, index) = store(&dir);
        store.append("a", Role::User, "one", "one").await.unwrap();
        store.append("a", Role::Assistant, "two", "two").await.unwrap();
        store.append("b", Role::User, "three", "three").await.unwrap();

        assert_eq!(store.clear("a").unwrap(), 2);
        assert!(store.dump_all("a").unwrap().is_empty());
        assert_eq!(store.dump_all("b").unwrap().len(), 1);
        assert_eq!(index.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_entries_keeps_turns_not_listed() {
        let dir = TempDir::new().unwrap();
        let (store, index) = store(&dir);
        let old = store.append("a", Role::User, "one", "one").await.unwrap();
        let fresh = store.append("a", Role::User, "two", "two").await.unwrap();

        assert_eq!(store.clear_entries("a", &[old.id]).unwrap(), 1);
        let left = store.dump_all("a").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh.id);
        assert_eq!(index.len().unwrap(), 1);
        assert_eq!(index.snapshot().unwrap()[0].1.row_id, fresh.id);
    }

    #[tokio::test]
    async fn empty_turn_is_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let (store, index) = store(&dir);
        let err = store.append("a", Role::User, " ", "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.dump_all("a").unwrap().is_empty());
        assert!(index.is_empty().unwrap());
    }
}
