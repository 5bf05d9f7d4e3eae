//! The memory engine: both tiers over one shared vector index

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::context::{context_metadata, ContextStore};
use crate::embedding::{EmbedKind, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::long_term::{fact_metadata, LongTermStore};
use crate::message::strip_stamp;
use crate::storage::{SqliteStorage, Tier, VectorIndex};

/// Coordinates SQLite, the vector index and the two tier stores.
///
/// SQLite is the source of truth. The vector index is a derived cache that
/// is checked against it on open and rebuilt from it when they disagree.
pub struct MemoryStore {
    config: Config,
    sqlite: SqliteStorage,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    context: ContextStore,
    long_term: LongTermStore,
}

impl MemoryStore {
    /// Open storage under the config's data directory.
    ///
    /// A vector index that is internally inconsistent, or that disagrees
    /// with the relational rows, is rebuilt when
    /// `config.repair_on_inconsistency` is set and is a hard error otherwise.
    pub async fn open(config: Config, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        if embedder.dimensions() != config.embedding_dimensions {
            return Err(Error::config(format!(
                "Embedding provider yields {} dimensions, config expects {}",
                embedder.dimensions(),
                config.embedding_dimensions
            )));
        }

        let sqlite = SqliteStorage::new(&config)?;

        let (index, mut problem) = match VectorIndex::open(&config) {
            Ok(index) => (index, None),
            Err(Error::Inconsistent(msg)) => (VectorIndex::empty(&config), Some(msg)),
            Err(e) => return Err(e),
        };
        let index = Arc::new(index);

        if problem.is_none() {
            problem = parity_problem(&sqlite, &index)?;
        }

        let context = ContextStore::new(sqlite.clone(), index.clone(), embedder.clone());
        let long_term = LongTermStore::new(sqlite.clone(), index.clone(), embedder.clone());
        let store = Self {
            config,
            sqlite,
            index,
            embedder,
            context,
            long_term,
        };

        if let Some(problem) = problem {
            if !store.config.repair_on_inconsistency {
                return Err(Error::inconsistent(problem));
            }
            warn!(%problem, "Vector index disagrees with relational storage, rebuilding");
            store.rebuild_index().await?;
        }

        info!(
            records = store.index.len()?,
            data_dir = %store.config.data_dir.display(),
            "Memory store ready"
        );
        Ok(store)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Short-term tier
    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    /// Long-term tier
    pub fn long_term(&self) -> &LongTermStore {
        &self.long_term
    }

    /// Get the vector index
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Every user with stored memory in either tier
    pub fn known_users(&self) -> Result<Vec<String>> {
        self.sqlite.known_users()
    }

    /// Re-derive every vector record from the relational rows.
    ///
    /// All embeddings are computed before the index is touched. Rows whose
    /// text has no embedding are skipped with a warning.
    pub async fn rebuild_index(&self) -> Result<usize> {
        let mut records = Vec::new();

        for entry in self.sqlite.all_context()? {
            let bare = strip_stamp(&entry.summary);
            let basis = if bare.trim().is_empty() { entry.content.as_str() } else { bare };
            match self.embedder.embed(basis, EmbedKind::Passage).await? {
                Some(embedding) => records.push((embedding, context_metadata(&entry))),
                None => warn!(id = entry.id, "Context row has no embeddable text, skipping"),
            }
        }

        for fact in self.sqlite.all_facts()? {
            match self.embedder.embed(&fact.summary, EmbedKind::Passage).await? {
                Some(embedding) => records.push((embedding, fact_metadata(&fact))),
                None => warn!(id = fact.id, "Long-term row has no embeddable text, skipping"),
            }
        }

        let count = records.len();
        self.index.replace_all(records)?;
        info!(records = count, "Rebuilt vector index from relational storage");
        Ok(count)
    }
}

/// Describe how the index and the relational rows disagree, if they do
fn parity_problem(sqlite: &SqliteStorage, index: &VectorIndex) -> Result<Option<String>> {
    let rows: BTreeSet<(bool, i64)> = sqlite
        .all_context()?
        .into_iter()
        .map(|e| (false, e.id))
        .chain(sqlite.all_facts()?.into_iter().map(|f| (true, f.id)))
        .collect();

    let records = index.snapshot()?;
    let vectors: BTreeSet<(bool, i64)> = records
        .iter()
        .map(|(_, m)| (m.tier == Tier::LongTerm, m.row_id))
        .collect();

    if vectors.len() != records.len() {
        return Ok(Some(format!(
            "{} vector records map to only {} distinct rows",
            records.len(),
            vectors.len()
        )));
    }
    if rows != vectors {
        return Ok(Some(format!(
            "{} relational rows ({} context, {} long-term) vs {} vector records",
            rows.len(),
            sqlite.count_context()?,
            sqlite.count_facts()?,
            records.len()
        )));
    }
    Ok(None)
}
