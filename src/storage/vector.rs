//! Exact inner-product vector index with companion-file persistence.
//!
//! Vectors and their metadata live in two parallel sequences: row `i` of the
//! vector array always describes the same record as `metadata[i]`. Both are
//! rewritten in full on every mutation (temp file + rename per file), and
//! both carry a shared generation counter so a crash between the two renames
//! is caught on the next load.
//!
//! There is no native removal: `delete` rebuilds the whole array from the
//! surviving rows. That is O(n) in the total record count and dominates cost
//! under heavy churn, which is acceptable for hundreds to thousands of
//! records per user.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::Config;
use crate::embedding::l2_norm;
use crate::error::{Error, Result};
use crate::message::Role;

/// Allowed deviation from unit length for stored and query vectors
const NORM_TOLERANCE: f32 = 1e-3;

/// Which memory tier a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Context,
    LongTerm,
}

/// Metadata stored next to each vector.
///
/// Carries every field needed to answer retrieval without touching SQLite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub user_id: String,
    pub tier: Tier,
    /// Id of the relational row this record mirrors
    pub row_id: i64,
    pub role: Role,
    pub content: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u8>,
}

impl RecordMetadata {
    pub fn belongs_to(&self, user_id: &str, tier: Tier) -> bool {
        self.user_id == user_id && self.tier == tier
    }
}

/// A scored search hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub score: f32,
    pub metadata: RecordMetadata,
}

#[derive(Serialize, Deserialize)]
struct VectorFile {
    generation: u64,
    dimensions: usize,
    count: usize,
    data: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct MetadataFile {
    generation: u64,
    count: usize,
    records: Vec<RecordMetadata>,
}

#[derive(Default)]
struct IndexState {
    /// Row-major, `metadata.len() * dimensions` floats
    vectors: Vec<f32>,
    metadata: Vec<RecordMetadata>,
    generation: u64,
}

impl IndexState {
    fn len(&self) -> usize {
        self.metadata.len()
    }
}

/// Exact nearest-neighbour index guarded by a single mutex.
///
/// Every add, delete and search takes the same lock; writers block readers
/// because a delete replaces the whole vector array.
pub struct VectorIndex {
    dimensions: usize,
    vector_path: PathBuf,
    metadata_path: PathBuf,
    state: Mutex<IndexState>,
}

impl VectorIndex {
    /// Load the index from the config's companion files.
    ///
    /// Missing files mean an empty index. One file without the other, a
    /// generation or count mismatch, or a dimension change is
    /// `Error::Inconsistent`.
    pub fn open(config: &Config) -> Result<Self> {
        let index = Self::empty(config);
        let state = load_state(&index.vector_path, &index.metadata_path, index.dimensions)?;
        debug!(records = state.len(), generation = state.generation, "Loaded vector index");
        *index.lock()? = state;
        Ok(index)
    }

    /// An empty index bound to the config's paths; nothing is read or written
    pub fn empty(config: &Config) -> Self {
        Self {
            dimensions: config.embedding_dimensions,
            vector_path: config.vector_path(),
            metadata_path: config.metadata_path(),
            state: Mutex::new(IndexState::default()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of records
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append a record and flush both files before returning
    pub fn add(&self, embedding: Vec<f32>, metadata: RecordMetadata) -> Result<()> {
        self.check_vector(&embedding)?;

        let mut state = self.lock()?;
        state.vectors.extend_from_slice(&embedding);
        state.metadata.push(metadata);
        state.generation += 1;

        if let Err(e) = self.write_files(&state) {
            let len = state.metadata.len() - 1;
            state.metadata.truncate(len);
            state.vectors.truncate(len * self.dimensions);
            state.generation -= 1;
            return Err(e);
        }
        Ok(())
    }

    /// Top `top_k` records with inner product >= `threshold`, best first
    pub fn search(&self, query: &[f32], top_k: usize, threshold: f32) -> Result<Vec<SearchHit>> {
        self.search_where(query, top_k, threshold, |_| true)
    }

    /// Like [`search`](Self::search), restricted to records matching `filter`
    /// before the top-k cut.
    pub fn search_where(
        &self,
        query: &[f32],
        top_k: usize,
        threshold: f32,
        filter: impl Fn(&RecordMetadata) -> bool,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimensions {
            return Err(Error::vector_index(format!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimensions,
                query.len()
            )));
        }

        let state = self.lock()?;
        if state.len() == 0 || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, usize)> = state
            .vectors
            .chunks_exact(self.dimensions)
            .enumerate()
            .filter(|(i, _)| filter(&state.metadata[*i]))
            .map(|(i, row)| (dot(query, row), i))
            .filter(|(score, _)| *score >= threshold)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, i)| SearchHit {
                score,
                metadata: state.metadata[i].clone(),
            })
            .collect())
    }

    /// Remove every record matching `predicate` by rebuilding the index from
    /// the survivors, then flush. Returns how many records were removed.
    pub fn delete(&self, predicate: impl Fn(&RecordMetadata) -> bool) -> Result<usize> {
        let mut state = self.lock()?;

        let mut rebuilt = IndexState {
            vectors: Vec::with_capacity(state.vectors.len()),
            metadata: Vec::with_capacity(state.len()),
            generation: state.generation + 1,
        };
        for (row, meta) in state.vectors.chunks_exact(self.dimensions).zip(&state.metadata) {
            if !predicate(meta) {
                rebuilt.vectors.extend_from_slice(row);
                rebuilt.metadata.push(meta.clone());
            }
        }

        let removed = state.len() - rebuilt.len();
        if removed == 0 {
            return Ok(0);
        }

        self.write_files(&rebuilt)?;
        *state = rebuilt;
        debug!(removed, remaining = state.len(), "Rebuilt vector index after delete");
        Ok(removed)
    }

    /// Apply `update` to the metadata of every record matching `predicate`,
    /// leaving vectors untouched. Returns how many records changed.
    pub fn update_metadata(
        &self,
        predicate: impl Fn(&RecordMetadata) -> bool,
        update: impl Fn(&mut RecordMetadata),
    ) -> Result<usize> {
        let mut state = self.lock()?;
        let previous = state.metadata.clone();

        let mut changed = 0;
        for meta in state.metadata.iter_mut() {
            if predicate(meta) {
                update(meta);
                changed += 1;
            }
        }
        if changed == 0 {
            return Ok(0);
        }

        state.generation += 1;
        if let Err(e) = self.write_files(&state) {
            state.metadata = previous;
            state.generation -= 1;
            return Err(e);
        }
        Ok(changed)
    }

    /// Replace the whole index with `records` and flush
    pub fn replace_all(&self, records: Vec<(Vec<f32>, RecordMetadata)>) -> Result<()> {
        for (embedding, _) in &records {
            self.check_vector(embedding)?;
        }

        let mut state = self.lock()?;
        let mut rebuilt = IndexState {
            vectors: Vec::with_capacity(records.len() * self.dimensions),
            metadata: Vec::with_capacity(records.len()),
            generation: state.generation + 1,
        };
        for (embedding, meta) in records {
            rebuilt.vectors.extend_from_slice(&embedding);
            rebuilt.metadata.push(meta);
        }

        self.write_files(&rebuilt)?;
        *state = rebuilt;
        Ok(())
    }

    /// Copy of every record, in index order
    pub fn snapshot(&self) -> Result<Vec<(Vec<f32>, RecordMetadata)>> {
        let state = self.lock()?;
        Ok(state
            .vectors
            .chunks_exact(self.dimensions)
            .zip(&state.metadata)
            .map(|(row, meta)| (row.to_vec(), meta.clone()))
            .collect())
    }

    fn check_vector(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(Error::vector_index(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }
        let norm = l2_norm(embedding);
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            return Err(Error::vector_index(format!(
                "Embedding is not unit length (norm {:.4})",
                norm
            )));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexState>> {
        self.state.lock().map_err(|e| Error::storage(e.to_string()))
    }

    fn write_files(&self, state: &IndexState) -> Result<()> {
        let vectors = VectorFile {
            generation: state.generation,
            dimensions: self.dimensions,
            count: state.len(),
            data: state.vectors.clone(),
        };
        let metadata = MetadataFile {
            generation: state.generation,
            count: state.len(),
            records: state.metadata.clone(),
        };

        let vector_tmp = temp_sibling(&self.vector_path)?;
        {
            let mut writer = BufWriter::new(vector_tmp.as_file());
            bincode::serialize_into(&mut writer, &vectors)?;
            writer.flush()?;
        }
        vector_tmp.as_file().sync_all()?;

        let metadata_tmp = temp_sibling(&self.metadata_path)?;
        {
            let mut writer = BufWriter::new(metadata_tmp.as_file());
            serde_json::to_writer(&mut writer, &metadata)?;
            writer.flush()?;
        }
        metadata_tmp.as_file().sync_all()?;

        vector_tmp
            .persist(&self.vector_path)
            .map_err(|e| Error::Io(e.error))?;
        metadata_tmp
            .persist(&self.metadata_path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> Result<NamedTempFile> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(NamedTempFile::new_in(dir)?)
}

fn load_state(vector_path: &Path, metadata_path: &Path, dimensions: usize) -> Result<IndexState> {
    match (vector_path.exists(), metadata_path.exists()) {
        (false, false) => return Ok(IndexState::default()),
        (true, false) => {
            return Err(Error::inconsistent(format!(
                "{} exists without {}",
                vector_path.display(),
                metadata_path.display()
            )))
        }
        (false, true) => {
            return Err(Error::inconsistent(format!(
                "{} exists without {}",
                metadata_path.display(),
                vector_path.display()
            )))
        }
        (true, true) => {}
    }

    let vectors: VectorFile = bincode::deserialize_from(BufReader::new(File::open(vector_path)?))?;
    let metadata: MetadataFile =
        serde_json::from_reader(BufReader::new(File::open(metadata_path)?))?;

    if vectors.dimensions != dimensions {
        return Err(Error::inconsistent(format!(
            "Index holds {}-dimensional vectors, config expects {}",
            vectors.dimensions, dimensions
        )));
    }
    if vectors.generation != metadata.generation {
        return Err(Error::inconsistent(format!(
            "Vector file generation {} does not match metadata generation {}",
            vectors.generation, metadata.generation
        )));
    }
    if vectors.count != metadata.count
        || metadata.records.len() != metadata.count
        || vectors.data.len() != vectors.count * dimensions
    {
        return Err(Error::inconsistent(format!(
            "Index holds {} vectors ({} floats) but {} metadata records",
            vectors.count,
            vectors.data.len(),
            metadata.records.len()
        )));
    }

    Ok(IndexState {
        vectors: vectors.data,
        metadata: metadata.records,
        generation: vectors.generation,
    })
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn config(dir: &TempDir) -> Config {
        Config {
            embedding_dimensions: DIM,
            ..Config::with_data_dir(dir.path())
        }
    }

    fn unit(values: [f32; DIM]) -> Vec<f32> {
        let mut v = values.to_vec();
        normalize(&mut v);
        v
    }

    fn meta(user: &str, tier: Tier, summary: &str) -> RecordMetadata {
        RecordMetadata {
            user_id: user.to_string(),
            tier,
            row_id: 0,
            role: Role::User,
            content: summary.to_string(),
            summary: summary.to_string(),
            timestamp: None,
            date: None,
            rate: None,
        }
    }

    #[test]
    fn empty_index_searches_to_nothing() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&config(&dir)).unwrap();
        let hits = index.search(&unit([1.0, 0.0, 0.0, 0.0]), 5, 0.0).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn add_rejects_wrong_length_and_non_unit_vectors() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&config(&dir)).unwrap();

        let err = index
            .add(vec![1.0, 0.0], meta("u", Tier::Context, "short"))
            .unwrap_err();
        assert!(matches!(err, Error::VectorIndex(_)));

        let err = index
            .add(vec![2.0, 0.0, 0.0, 0.0], meta("u", Tier::Context, "long"))
            .unwrap_err();
        assert!(matches!(err, Error::VectorIndex(_)));
        assert_eq!(index.len().unwrap(), 0);
    }

    #[test]
    fn search_orders_by_score_and_respects_threshold() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&config(&dir)).unwrap();
        index.add(unit([1.0, 0.0, 0.0, 0.0]), meta("u", Tier::Context, "x")).unwrap();
        index.add(unit([1.0, 1.0, 0.0, 0.0]), meta("u", Tier::Context, "xy")).unwrap();
        index.add(unit([0.0, 0.0, 1.0, 0.0]), meta("u", Tier::Context, "z")).unwrap();

        let query = unit([1.0, 0.0, 0.0, 0.0]);
        let all = index.search(&query, 10, -1.0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].metadata.summary, "x");
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));

        let mut previous = all.len();
        for threshold in [0.0, 0.5, 0.8, 1.1] {
            let hits = index.search(&query, 10, threshold).unwrap();
            assert!(hits.len() <= previous);
            previous = hits.len();
        }
        assert_eq!(index.search(&query, 1, -1.0).unwrap().len(), 1);
    }

    #[test]
    fn search_where_filters_before_top_k() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&config(&dir)).unwrap();
        index.add(unit([1.0, 0.0, 0.0, 0.0]), meta("a", Tier::Context, "a1")).unwrap();
        index.add(unit([0.9, 0.1, 0.0, 0.0]), meta("b", Tier::Context, "b1")).unwrap();

        let hits = index
            .search_where(&unit([1.0, 0.0, 0.0, 0.0]), 1, 0.0, |m| m.user_id == "b")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.summary, "b1");
    }

    #[test]
    fn delete_removes_matches_and_keeps_survivors_intact() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&config(&dir)).unwrap();
        let keep_a = unit([1.0, 2.0, 0.0, 0.0]);
        let keep_b = unit([0.0, 0.0, 3.0, 1.0]);
        index.add(keep_a.clone(), meta("a", Tier::Context, "keep-a")).unwrap();
        index.add(unit([1.0, 1.0, 1.0, 1.0]), meta("b", Tier::Context, "drop-1")).unwrap();
        index.add(keep_b.clone(), meta("a", Tier::LongTerm, "keep-b")).unwrap();
        index.add(unit([0.0, 1.0, 0.0, 0.0]), meta("b", Tier::Context, "drop-2")).unwrap();

        let removed = index.delete(|m| m.user_id == "b").unwrap();
        assert_eq!(removed, 2);

        let survivors = index.snapshot().unwrap();
        assert_eq!(survivors.len(), 2);
        assert!(survivors.iter().all(|(_, m)| m.user_id != "b"));
        assert_eq!(survivors[0], (keep_a, meta("a", Tier::Context, "keep-a")));
        assert_eq!(survivors[1], (keep_b, meta("a", Tier::LongTerm, "keep-b")));
    }

    #[test]
    fn delete_with_no_match_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&config(&dir)).unwrap();
        index.add(unit([1.0, 0.0, 0.0, 0.0]), meta("a", Tier::Context, "a")).unwrap();
        assert_eq!(index.delete(|m| m.user_id == "nobody").unwrap(), 0);
        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn reopen_restores_vectors_and_metadata() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        {
            let index = VectorIndex::open(&cfg).unwrap();
            index.add(unit([1.0, 0.0, 0.0, 0.0]), meta("a", Tier::Context, "one")).unwrap();
            index.add(unit([0.0, 1.0, 0.0, 0.0]), meta("a", Tier::LongTerm, "two")).unwrap();
            index.delete(|m| m.summary == "one").unwrap();
        }

        let index = VectorIndex::open(&cfg).unwrap();
        let records = index.snapshot().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.summary, "two");
        assert_eq!(records[0].0, unit([0.0, 1.0, 0.0, 0.0]));
    }

    #[test]
    fn update_metadata_rewrites_in_place() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let index = VectorIndex::open(&cfg).unwrap();
        index.add(unit([1.0, 0.0, 0.0, 0.0]), meta("a", Tier::LongTerm, "fact")).unwrap();

        let changed = index
            .update_metadata(|m| m.summary == "fact", |m| m.rate = Some(7))
            .unwrap();
        assert_eq!(changed, 1);

        let reopened = VectorIndex::open(&cfg).unwrap();
        assert_eq!(reopened.snapshot().unwrap()[0].1.rate, Some(7));
    }

    #[test]
    fn missing_companion_file_is_inconsistent() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        {
            let index = VectorIndex::open(&cfg).unwrap();
            index.add(unit([1.0, 0.0, 0.0, 0.0]), meta("a", Tier::Context, "x")).unwrap();
        }
        std::fs::remove_file(cfg.metadata_path()).unwrap();

        assert!(matches!(VectorIndex::open(&cfg), Err(Error::Inconsistent(_))));
    }

    #[test]
    fn stale_companion_file_is_inconsistent() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let index = VectorIndex::open(&cfg).unwrap();
        index.add(unit([1.0, 0.0, 0.0, 0.0]), meta("a", Tier::Context, "x")).unwrap();
        let old_metadata = std::fs::read(cfg.metadata_path()).unwrap();
        index.add(unit([0.0, 1.0, 0.0, 0.0]), meta("a", Tier::Context, "y")).unwrap();
        std::fs::write(cfg.metadata_path(), old_metadata).unwrap();

        assert!(matches!(VectorIndex::open(&cfg), Err(Error::Inconsistent(_))));
    }

    #[test]
    fn parity_holds_across_mixed_operations() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndex::open(&config(&dir)).unwrap();
        for i in 0..12 {
            let user = if i % 3 == 0 { "a" } else { "b" };
            index
                .add(unit([1.0, i as f32, 0.5, 0.0]), meta(user, Tier::Context, &i.to_string()))
                .unwrap();
            if i % 4 == 3 {
                index.delete(|m| m.user_id == "a").unwrap();
            }
            let state = index.lock().unwrap();
            assert_eq!(state.vectors.len(), state.metadata.len() * DIM);
        }
    }
}
