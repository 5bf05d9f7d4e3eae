//! One live conversational turn over the memory engine

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::message::{readable_stamp, Role};
use crate::provider::{Compressor, Generator};
use crate::retrieval::RetrievalComposer;

/// Shown to the user when a turn cannot be completed
pub const FAILURE_REPLY: &str = "Sorry, I could not process that message.";

/// Result of handling one turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub reply: String,
    pub memories_used: usize,
}

/// Handles a user message: recall, reply, remember.
pub struct TurnHandler {
    store: Arc<MemoryStore>,
    composer: RetrievalComposer,
    generator: Arc<dyn Generator>,
    compressor: Arc<dyn Compressor>,
}

impl TurnHandler {
    pub fn new(
        store: Arc<MemoryStore>,
        generator: Arc<dyn Generator>,
        compressor: Arc<dyn Compressor>,
    ) -> Self {
        let composer = RetrievalComposer::for_store(&store);
        Self {
            store,
            composer,
            generator,
            compressor,
        }
    }

    /// Produce a reply and record both sides of the turn
    pub async fn respond(&self, user_id: &str, text: &str) -> Result<TurnReply> {
        self.respond_at(user_id, text, Utc::now()).await
    }

    pub async fn respond_at(
        &self,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<TurnReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::invalid_input("Message is empty"));
        }
        let config = self.store.config();

        let retrieved = self.composer.compose(user_id, text).await?;
        let prompt = format!(
            "User wrote [{}]: {}\nReply without stating the time:",
            readable_stamp(now),
            text
        );
        let reply = self
            .generator
            .generate(&prompt, &retrieved.prior_turns(), &config.system_prompt)
            .await?;

        let user_summary = if text.split_whitespace().count() < config.summarize_min_words {
            text.to_string()
        } else {
            self.compressor.summarize(text).await?
        };
        self.store
            .context()
            .append_at(user_id, Role::User, text, &user_summary, now)
            .await?;

        let reply_summary = self.compressor.summarize(&reply).await?;
        self.store
            .context()
            .append_at(user_id, Role::Assistant, &reply, &reply_summary, now)
            .await?;

        info!(
            user_id,
            facts = retrieved.facts.len(),
            turns = retrieved.turns.len(),
            "Handled turn"
        );
        Ok(TurnReply {
            reply,
            memories_used: retrieved.facts.len() + retrieved.turns.len(),
        })
    }

    /// Like [`respond`](Self::respond), but any failure becomes the apology
    pub async fn respond_or_apologize(&self, user_id: &str, text: &str) -> String {
        match self.respond(user_id, text).await {
            Ok(turn) => turn.reply,
            Err(e) => {
                error!(user_id, error = %e, "Turn failed");
                FAILURE_REPLY.to_string()
            }
        }
    }
}
