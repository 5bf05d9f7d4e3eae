//! Importance rating for long-term memory

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::readable_stamp;
use crate::provider::{ChatMessage, CompletionBackend, CompletionRequest, OutputBudget};

/// Highest rating a fact can hold
pub const MAX_RATING: u8 = 10;

/// Outcome of rating one fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Importance {
    pub is_important: bool,
    pub rating: u8,
}

impl Importance {
    pub fn from_rating(rating: u8, threshold: u8) -> Self {
        Self {
            is_important: rating >= threshold,
            rating,
        }
    }
}

/// Rates how worth remembering a fact is, on a 0-10 scale.
///
/// Ratings of 9 and 10 do not decay. Ratings 6 to 8 lose about a point per
/// five days since `recorded`. Anything at 5 or below is unimportant.
#[async_trait]
pub trait ImportanceScorer: Send + Sync {
    async fn score(&self, fact: &str, recorded: NaiveDate) -> Result<Importance>;
}

/// Random ±1 nudge applied to raw ratings.
///
/// Borderline facts may land on either side of the importance threshold
/// from one run to the next. Tests use [`Jitter::disabled`] or a fixed seed.
pub struct Jitter {
    rng: Option<Mutex<StdRng>>,
}

impl Jitter {
    pub fn disabled() -> Self {
        Self { rng: None }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Some(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Some(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Nudge `raw` by -1, 0 or +1 and clamp to 0-10
    pub fn apply(&self, raw: u8) -> u8 {
        let offset = match &self.rng {
            Some(rng) => match rng.lock() {
                Ok(mut rng) => rng.gen_range(-1i16..=1),
                Err(poisoned) => poisoned.into_inner().gen_range(-1i16..=1),
            },
            None => 0,
        };
        (raw as i16 + offset).clamp(0, MAX_RATING as i16) as u8
    }
}

/// First whitespace-separated token that is a whole number from 0 to 10
pub fn parse_rating(reply: &str) -> Option<u8> {
    reply
        .split_whitespace()
        .filter(|token| token.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|token| token.parse::<u8>().ok())
        .find(|value| *value <= MAX_RATING)
}

/// Importance scoring through a completion backend
pub struct LlmImportanceScorer {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    jitter: Jitter,
    threshold: u8,
}

impl LlmImportanceScorer {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
        jitter: Jitter,
        threshold: u8,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            jitter,
            threshold,
        }
    }
}

#[async_trait]
impl ImportanceScorer for LlmImportanceScorer {
    async fn score(&self, fact: &str, recorded: NaiveDate) -> Result<Importance> {
        let prompt = rating_prompt(fact, recorded, &readable_stamp(Utc::now()));
        let reply = self
            .backend
            .complete(CompletionRequest {
                model: self.model.clone(),
                messages: vec![ChatMessage::user(prompt)],
                budget: OutputBudget::Rating,
            })
            .await?;

        let raw = parse_rating(reply.trim())
            .ok_or_else(|| Error::malformed(format!("No rating in reply: {:?}", reply)))?;
        let rating = self.jitter.apply(raw);
        debug!(raw, rating, "Rated fact");

        Ok(Importance::from_rating(rating, self.threshold))
    }
}

fn rating_prompt(fact: &str, recorded: NaiveDate, today: &str) -> String {
    format!(
        "You are an expert in assessing information importance. \
         Answer ONLY with a whole number from 0 to 10. No explanation.\n\n\
         # Time-Based Importance Scale\n\
         [ETERNALLY RELEVANT]\n\
         10 = Lifetime goals, dreams, values\n\
         9 = Key events with a lifelong effect\n\n\
         [TEMPORARILY RELEVANT]\n\
         8 = Important, but time-sensitive\n\
         7 = Current tasks\n\
         6 = Contextual facts\n\n\
         [INSIGNIFICANT]\n\
         0-5 = Routine, one-off mentions, outdated data\n\n\
         # Assessment Criteria\n\
         1. Initial Importance: Determine a base score based on content\n\
         2. Time-Based Importance:\n\
         - For categories 6-8: Reduce by 1 point for every 5 days since the fact, \
         unless there is a specific validity period.\n\
         - Today: {today}\n\
         - Fact from: {recorded}\n\
         3. For 9-10 points, time is NOT taken into account.\n\n\
         Fact: \"{fact}\"\n\n\
         Answer (only number 0-10):"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl CompletionBackend for Fixed {
        async fn complete(&self, _request: CompletionRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn scorer(reply: &'static str) -> LlmImportanceScorer {
        LlmImportanceScorer::new(Arc::new(Fixed(reply)), "m", Jitter::disabled(), 6)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn rating_is_first_in_range_integer_token() {
        assert_eq!(parse_rating("7"), Some(7));
        assert_eq!(parse_rating("Score: 42 then 8"), Some(8));
        assert_eq!(parse_rating("8/10"), None);
        assert_eq!(parse_rating("0"), Some(0));
        assert_eq!(parse_rating("none"), None);
    }

    #[test]
    fn jitter_stays_within_one_and_in_range() {
        let jitter = Jitter::seeded(7);
        for _ in 0..200 {
            let nudged = jitter.apply(5);
            assert!((4..=6).contains(&nudged));
            assert!(jitter.apply(10) >= 9);
            assert!(jitter.apply(0) <= 1);
        }
        assert_eq!(Jitter::disabled().apply(6), 6);
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let a = Jitter::seeded(42);
        let b = Jitter::seeded(42);
        let xs: Vec<_> = (0..20).map(|_| a.apply(5)).collect();
        let ys: Vec<_> = (0..20).map(|_| b.apply(5)).collect();
        assert_eq!(xs, ys);
    }

    #[tokio::test]
    async fn six_is_the_importance_boundary() {
        let high = scorer("6").score("x", day()).await.unwrap();
        assert_eq!(high, Importance { is_important: true, rating: 6 });

        let low = scorer(" 5 ").score("x", day()).await.unwrap();
        assert!(!low.is_important);
    }

    #[tokio::test]
    async fn reply_without_rating_is_malformed() {
        let err = scorer("I cannot rate that").score("x", day()).await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn prompt_carries_both_dates_and_the_fact() {
        let prompt = rating_prompt("Has a cat", day(), "18.10 09:30");
        assert!(prompt.contains("Today: 18.10 09:30"));
        assert!(prompt.contains("Fact from: 2026-03-14"));
        assert!(prompt.contains("Fact: \"Has a cat\""));
    }
}
