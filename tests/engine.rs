//! End-to-end behavior of the memory engine over real on-disk storage

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use tiered_memory::context::RecentTurn;
use tiered_memory::embedding::{normalize, HashingEmbedder};
use tiered_memory::provider::Compressor;
use tiered_memory::scoring::Importance;
use tiered_memory::storage::{RecordMetadata, Tier, VectorIndex};
use tiered_memory::{Config, ImportanceScorer, MemoryStore, OffloadPipeline, Result, Role};

const DIMS: usize = 128;

fn config(dir: &TempDir) -> Config {
    Config {
        embedding_dimensions: DIMS,
        ..Config::with_data_dir(dir.path())
    }
}

async fn open(dir: &TempDir) -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::open(config(dir), Arc::new(HashingEmbedder::new(DIMS)))
            .await
            .unwrap(),
    )
}

fn random_unit(rng: &mut StdRng) -> Vec<f32> {
    let mut v: Vec<f32> = (0..DIMS).map(|_| rng.gen_range(-1.0..1.0)).collect();
    normalize(&mut v);
    v
}

fn metadata(user_id: &str, row_id: i64) -> RecordMetadata {
    RecordMetadata {
        user_id: user_id.to_string(),
        tier: Tier::Context,
        row_id,
        role: Role::User,
        content: format!("content {}", row_id),
        summary: format!("summary {}", row_id),
        timestamp: Some(Utc::now()),
        date: None,
        rate: None,
    }
}

/// Always returns the same rating
struct FixedScorer(u8);

#[async_trait]
impl ImportanceScorer for FixedScorer {
    async fn score(&self, _fact: &str, _recorded: NaiveDate) -> Result<Importance> {
        Ok(Importance::from_rating(self.0, 6))
    }
}

struct Verbatim;

#[async_trait]
impl Compressor for Verbatim {
    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    async fn extract_fact(&self, text: &str, _date: NaiveDate) -> Result<String> {
        Ok(tiered_memory::message::strip_stamp(text).to_string())
    }
}

#[tokio::test]
async fn vectors_and_rows_stay_in_step_across_mutations() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir).await;
        let context = store.context();
        let long_term = store.long_term();

        context.append("a", Role::User, "I run every morning", "runs every morning").await.unwrap();
        context.append("b", Role::User, "my sister lives in Rome", "sister in Rome").await.unwrap();
        long_term.promote("a", Role::User, "x", "Runs every morning", 7).await.unwrap();
        long_term.promote("b", Role::User, "x", "Sister lives in Rome", 8).await.unwrap();
        context.clear("a").unwrap();
        long_term.evict("b", "Sister lives in Rome").unwrap();
        long_term.rerate("a", "Runs every morning", 6).unwrap();

        let rows = context.dump_all("a").unwrap().len()
            + context.dump_all("b").unwrap().len()
            + long_term.facts("a").unwrap().len()
            + long_term.facts("b").unwrap().len();
        assert_eq!(store.index().len().unwrap(), rows);
        assert_eq!(rows, 2);
    }

    // A clean reopen needs no repair
    let strict = Config {
        repair_on_inconsistency: false,
        ..config(&dir)
    };
    let store = MemoryStore::open(strict, Arc::new(HashingEmbedder::new(DIMS)))
        .await
        .unwrap();
    assert_eq!(store.index().len().unwrap(), 2);
}

#[test]
fn delete_removes_exactly_the_matching_records() {
    let dir = TempDir::new().unwrap();
    let index = VectorIndex::open(&config(&dir)).unwrap();
    let mut rng = StdRng::seed_from_u64(11);

    let mut kept = Vec::new();
    for i in 0..30 {
        let user = if i % 3 == 0 { "gone" } else { "stays" };
        let vector = random_unit(&mut rng);
        if user == "stays" {
            kept.push((vector.clone(), i));
        }
        index.add(vector, metadata(user, i)).unwrap();
    }

    assert_eq!(index.delete(|m| m.user_id == "gone").unwrap(), 10);

    let survivors = index.snapshot().unwrap();
    assert!(survivors.iter().all(|(_, m)| m.user_id != "gone"));
    assert_eq!(survivors.len(), kept.len());
    for ((vector, meta), (expected, row_id)) in survivors.iter().zip(&kept) {
        assert_eq!(meta.row_id, *row_id);
        assert_eq!(vector, expected);
    }

    let reopened = VectorIndex::open(&config(&dir)).unwrap();
    assert_eq!(reopened.len().unwrap(), kept.len());
}

#[test]
fn raising_threshold_never_adds_results() {
    let dir = TempDir::new().unwrap();
    let index = VectorIndex::open(&config(&dir)).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    for i in 0..40 {
        index.add(random_unit(&mut rng), metadata("u", i)).unwrap();
    }
    let query = random_unit(&mut rng);

    let mut previous = usize::MAX;
    for step in -10..=10 {
        let threshold = step as f32 / 10.0;
        let hits = index.search(&query, 40, threshold).unwrap();
        assert!(hits.len() <= previous);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| h.score >= threshold));
        previous = hits.len();
    }
}

#[tokio::test]
async fn latest_user_turn_is_not_compressed_in_recent_window() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let start = Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap();
    let context = store.context();
    context.append_at("u", Role::User, "hi", "hi", start).await.unwrap();
    context
        .append_at("u", Role::Assistant, "hey", "hey", start + Duration::seconds(5))
        .await
        .unwrap();
    context
        .append_at("u", Role::User, "I love cats", "likes cats", start + Duration::seconds(10))
        .await
        .unwrap();

    let window = context.recent_window("u", 3).unwrap();
    assert_eq!(
        window.last(),
        Some(&RecentTurn {
            role: Role::User,
            text: "I love cats".to_string()
        })
    );
}

#[tokio::test]
async fn eternal_facts_survive_prune_whatever_the_scorer_says() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store
        .long_term()
        .promote("u", Role::User, "x", "Dreams of sailing around the world", 10)
        .await
        .unwrap();
    store
        .long_term()
        .promote("u", Role::User, "x", "Ate pasta yesterday", 6)
        .await
        .unwrap();

    let pipeline = OffloadPipeline::new(store.clone(), Arc::new(FixedScorer(0)), Arc::new(Verbatim));
    for _ in 0..3 {
        pipeline.prune("u").await.unwrap();
    }

    let facts = store.long_term().facts("u").unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].rate, 10);
}

#[tokio::test]
async fn offloading_an_empty_context_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store
        .long_term()
        .promote("u", Role::User, "x", "Works as a nurse", 8)
        .await
        .unwrap();
    let facts_before = store.long_term().facts("u").unwrap();
    let index_before = store.index().snapshot().unwrap();

    let pipeline = OffloadPipeline::new(store.clone(), Arc::new(FixedScorer(9)), Arc::new(Verbatim));
    let report = pipeline.offload("u").await.unwrap();

    assert_eq!(report.examined, 0);
    assert_eq!(store.long_term().facts("u").unwrap(), facts_before);
    assert_eq!(store.index().snapshot().unwrap(), index_before);
}

#[tokio::test]
async fn promoted_fact_is_found_by_its_own_summary() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let summary = "The user is allergic to peanuts";
    store.long_term().promote("u", Role::User, "x", summary, 9).await.unwrap();

    let matches = store.long_term().semantic_match("u", summary, 0.0, 5).await.unwrap();
    assert!(matches.iter().any(|m| m.summary == summary));
}

#[tokio::test]
async fn full_cycle_moves_context_into_long_term_memory() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    store
        .context()
        .append("u", Role::User, "We are expecting a baby in March", "expecting a baby in March")
        .await
        .unwrap();

    let pipeline = OffloadPipeline::new(store.clone(), Arc::new(FixedScorer(8)), Arc::new(Verbatim));
    let report = pipeline.run_all().await.unwrap().unwrap();

    assert_eq!(report.promoted, 1);
    assert!(store.context().dump_all("u").unwrap().is_empty());
    let matches = store
        .long_term()
        .semantic_match("u", "baby in March", 0.1, 5)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].summary, "expecting a baby in March");
    assert_eq!(store.index().len().unwrap(), 1);
}

#[tokio::test]
async fn missing_vector_file_is_rebuilt_on_open() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir).await;
        store.context().append("u", Role::User, "hello there", "hello").await.unwrap();
        store.long_term().promote("u", Role::User, "x", "Plays piano", 7).await.unwrap();
    }
    std::fs::remove_file(config(&dir).vector_path()).unwrap();

    let store = open(&dir).await;
    assert_eq!(store.index().len().unwrap(), 2);
    let matches = store.long_term().semantic_match("u", "Plays piano", 0.5, 5).await.unwrap();
    assert_eq!(matches.len(), 1);
}
