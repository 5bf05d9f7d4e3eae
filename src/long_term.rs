//! Long-term tier: durable facts rated by importance

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::{EmbedKind, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::message::{LongTermFact, Role};
use crate::storage::{RecordMetadata, SqliteStorage, Tier, VectorIndex};

/// A long-term fact found by semantic search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactMatch {
    pub role: Role,
    pub summary: String,
    pub rate: Option<u8>,
    pub score: f32,
}

/// Long-term memory store.
///
/// Facts are keyed by `(user_id, summary)`. Promoting a summary the user
/// already has keeps a single row, so eviction by summary never removes
/// more than the one fact it names.
#[derive(Clone)]
pub struct LongTermStore {
    sqlite: SqliteStorage,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl LongTermStore {
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

    /// Store a fact dated today
    pub async fn promote(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: &str,
        rate: u8,
    ) -> Result<LongTermFact> {
        self.promote_on(user_id, role, content, summary, rate, Utc::now().date_naive())
            .await
    }

    /// Store a fact with an explicit date.
    ///
    /// If the user already holds a fact with this exact summary, no new row
    /// is written; the existing rating is raised to `rate` when higher.
    pub async fn promote_on(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: &str,
        rate: u8,
        date: NaiveDate,
    ) -> Result<LongTermFact> {
        if rate > 10 {
            return Err(Error::invalid_input(format!("Rating {} is outside 0-10", rate)));
        }
        let summary = summary.trim();

        if let Some(mut existing) = self.sqlite.find_fact(user_id, summary)? {
            if rate > existing.rate {
                self.rerate(user_id, summary, rate)?;
                existing.rate = rate;
            }
            debug!(user_id, summary, "Fact already known, not duplicating");
            return Ok(existing);
        }

        let embedding = self
            .embedder
            .embed(summary, EmbedKind::Passage)
            .await?
            .ok_or_else(|| Error::invalid_input("Cannot promote an empty fact"))?;

        let fact = self
            .sqlite
            .insert_fact(user_id, role, content, summary, date, rate)?;

        if let Err(e) = self.index.add(embedding, fact_metadata(&fact)) {
            if let Err(rollback) = self.sqlite.delete_fact_row(fact.id) {
                warn!(user_id, error = %rollback, "Failed to roll back long-term row");
            }
            return Err(e);
        }

        info!(user_id, rate, id = fact.id, "Promoted fact to long-term memory");
        Ok(fact)
    }

    /// Facts of this user semantically close to `query`, best first
    pub async fn semantic_match(
        &self,
        user_id: &str,
        query: &str,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<FactMatch>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let Some(query_embedding) = self.embedder.embed(query, EmbedKind::Query).await? else {
            return Ok(Vec::new());
        };

        let hits = self.index.search_where(&query_embedding, top_k, threshold, |m| {
            m.belongs_to(user_id, Tier::LongTerm)
        })?;

        Ok(hits
            .into_iter()
            .map(|hit| FactMatch {
                role: hit.metadata.role,
                summary: hit.metadata.summary,
                rate: hit.metadata.rate,
                score: hit.score,
            })
            .collect())
    }

    /// Every fact held for a user
    pub fn facts(&self, user_id: &str) -> Result<Vec<LongTermFact>> {
        self.sqlite.facts(user_id)
    }

    /// Remove the fact with this exact summary from both storages
    pub fn evict(&self, user_id: &str, summary: &str) -> Result<usize> {
        let rows = self.sqlite.delete_fact(user_id, summary)?;
        self.index
            .delete(|m| m.belongs_to(user_id, Tier::LongTerm) && m.summary == summary)?;
        info!(user_id, summary, "Evicted long-term fact");
        Ok(rows)
    }

    /// Change a fact's rating in the row and in its vector metadata
    pub fn rerate(&self, user_id: &str, summary: &str, new_rate: u8) -> Result<usize> {
        if new_rate > 10 {
            return Err(Error::invalid_input(format!("Rating {} is outside 0-10", new_rate)));
        }
        let rows = self.sqlite.update_rate(user_id, summary, new_rate)?;
        self.index.update_metadata(
            |m| m.belongs_to(user_id, Tier::LongTerm) && m.summary == summary,
            |m| m.rate = Some(new_rate),
        )?;
        debug!(user_id, summary, new_rate, "Re-rated long-term fact");
        Ok(rows)
    }
}

/// Vector metadata mirroring a long-term row
pub(crate) fn fact_metadata(fact: &LongTermFact) -> RecordMetadata {
    RecordMetadata {
        user_id: fact.user_id.clone(),
        tier: Tier::LongTerm,
        row_id: fact.id,
        role: fact.role,
        content: fact.content.clone(),
        summary: fact.summary.clone(),
        timestamp: None,
        date: Some(fact.date),
        rate: Some(fact.rate),
    }
}
