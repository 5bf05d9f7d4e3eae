//! Memory retrieval for prompt injection

use serde::Serialize;

use crate::config::Config;
use crate::context::{ContextMatch, ContextStore};
use crate::embedding::TokenCounter;
use crate::error::Result;
use crate::long_term::{FactMatch, LongTermStore};
use crate::memory::MemoryStore;
use crate::provider::ChatMessage;

const LONG_TERM_HEADER: &str = "Relevant memories from past conversations (use only if relevant):";
const CONTEXT_HEADER: &str = "Relevant lines from the current conversation:";

/// Retrieved memory ready to be sent ahead of the live query
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalContext {
    /// Long-term facts, best match first
    pub facts: Vec<FactMatch>,

    /// Context turns, oldest first
    pub turns: Vec<ContextMatch>,

    /// Rough token count of the rendered blocks
    pub total_tokens: u32,
}

impl RetrievalContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.turns.is_empty()
    }

    /// Render the non-empty blocks as prior user turns.
    ///
    /// Long-term memories come first, then lines from the current
    /// conversation. A tier with no matches produces no message.
    pub fn prior_turns(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);

        if !self.facts.is_empty() {
            let lines: Vec<String> = self
                .facts
                .iter()
                .map(|f| format!("- {}: {}", f.role.speaker(), f.summary))
                .collect();
            messages.push(ChatMessage::user(format!("{}\n{}", LONG_TERM_HEADER, lines.join("\n"))));
        }

        if !self.turns.is_empty() {
            let lines: Vec<String> = self
                .turns
                .iter()
                .map(|t| format!("- {}: {}", t.role.speaker(), t.summary))
                .collect();
            messages.push(ChatMessage::user(format!("{}\n{}", CONTEXT_HEADER, lines.join("\n"))));
        }

        messages
    }
}

/// Merges long-term and context matches for a query
pub struct RetrievalComposer {
    context: ContextStore,
    long_term: LongTermStore,
    threshold: f32,
    top_k: usize,
}

impl RetrievalComposer {
    pub fn new(context: ContextStore, long_term: LongTermStore, config: &Config) -> Self {
        Self {
            context,
            long_term,
            threshold: config.search_threshold,
            top_k: config.search_top_k,
        }
    }

    pub fn for_store(store: &MemoryStore) -> Self {
        Self::new(store.context().clone(), store.long_term().clone(), store.config())
    }

    /// Gather everything relevant to `query` for one user
    pub async fn compose(&self, user_id: &str, query: &str) -> Result<RetrievalContext> {
        if query.trim().is_empty() {
            return Ok(RetrievalContext::empty());
        }

        let facts = self
            .long_term
            .semantic_match(user_id, query, self.threshold, self.top_k)
            .await?;

        let mut turns = self
            .context
            .semantic_match(user_id, query, self.threshold, self.top_k)
            .await?;
        turns.sort_by_key(|t| (t.timestamp, t.row_id));

        let total_tokens = facts
            .iter()
            .map(|f| TokenCounter::estimate(&f.summary))
            .chain(turns.iter().map(|t| TokenCounter::estimate(&t.summary)))
            .sum();

        Ok(RetrievalContext {
            facts,
            turns,
            total_tokens,
        })
    }
}
