//! Remote text-generation collaborators.
//!
//! One OpenRouter-style chat-completions client backs three narrow roles:
//! reply generation, compression (summaries and fact extraction) and, in
//! [`crate::scoring`], importance rating.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::embedding::TokenCounter;
use crate::error::{Error, Result};

/// Output cap for replies and ratings
const DEFAULT_MAX_TOKENS: u32 = 2560;

/// Role of a chat message sent to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A chat message sent to the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// How many output tokens a request may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputBudget {
    /// Fixed cap for conversational replies
    Reply,
    /// Fixed cap for importance ratings
    Rating,
    /// Half the prompt's token count, so compression always compresses
    Summary,
}

/// One completion call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub budget: OutputBudget,
}

/// Anything that can answer a chat-completion request
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Produces the assistant's reply for a live turn
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        prior_turns: &[ChatMessage],
        system_prompt: &str,
    ) -> Result<String>;
}

/// Shortens text for storage
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compress a turn to one or two sentences
    async fn summarize(&self, text: &str) -> Result<String>;

    /// Pull the single most important fact out of a summary
    async fn extract_fact(&self, text: &str, date: NaiveDate) -> Result<String>;
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint.
///
/// A failed network call is retried once with the fallback key when one is
/// configured. An `error` object or a missing `choices` array in the body is
/// returned as-is without retrying.
pub struct CompletionClient {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    fallback_api_key: Option<String>,
    tokens: TokenCounter,
}

impl CompletionClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            fallback_api_key: config.fallback_api_key.clone(),
            tokens: TokenCounter::for_gpt()?,
        })
    }

    fn max_tokens(&self, request: &CompletionRequest) -> u32 {
        match request.budget {
            OutputBudget::Reply | OutputBudget::Rating => DEFAULT_MAX_TOKENS,
            OutputBudget::Summary => {
                let prompt_tokens = request
                    .messages
                    .last()
                    .map(|m| self.tokens.count(&m.content))
                    .unwrap_or(0);
                ((prompt_tokens + 1) / 2).max(1)
            }
        }
    }

    async fn send(&self, body: &Value, api_key: Option<&str>) -> Result<Value> {
        let mut request = self.http.post(&self.api_url).json(body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl CompletionBackend for CompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": self.max_tokens(&request),
        });

        let result = match self.send(&body, self.api_key.as_deref()).await {
            Ok(value) => value,
            Err(first) if first.is_transient() && self.fallback_api_key.is_some() => {
                warn!(error = %first, "Completion failed with primary key, retrying with fallback");
                self.send(&body, self.fallback_api_key.as_deref())
                    .await
                    .map_err(|second| {
                        Error::collaborator(format!("Both keys failed: {} | {}", first, second))
                    })?
            }
            Err(e) => return Err(e),
        };

        let content = extract_content(&result)?;
        debug!(model = %request.model, chars = content.len(), "Completion received");
        Ok(content)
    }
}

/// Pull `choices[0].message.content` out of a completion body
fn extract_content(body: &Value) -> Result<String> {
    if let Some(error) = body.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown API error");
        return Err(Error::collaborator(format!("Provider error: {}", message)));
    }

    body.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::malformed(format!("Response has no choices: {}", body)))
}

/// Reply generation through a completion backend
pub struct LlmGenerator {
    backend: Arc<dyn CompletionBackend>,
    model: String,
}

impl LlmGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(
        &self,
        prompt: &str,
        prior_turns: &[ChatMessage],
        system_prompt: &str,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(prior_turns.len() + 2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.extend_from_slice(prior_turns);
        messages.push(ChatMessage::user(prompt));

        self.backend
            .complete(CompletionRequest {
                model: self.model.clone(),
                messages,
                budget: OutputBudget::Reply,
            })
            .await
    }
}

/// Summaries and fact extraction through a completion backend
pub struct LlmCompressor {
    backend: Arc<dyn CompletionBackend>,
    model: String,
}

impl LlmCompressor {
    pub fn new(backend: Arc<dyn CompletionBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
        }
    }

    async fn ask(&self, prompt: String) -> Result<String> {
        self.backend
            .complete(CompletionRequest {
                model: self.model.clone(),
                messages: vec![ChatMessage::user(prompt)],
                budget: OutputBudget::Summary,
            })
            .await
    }
}

#[async_trait]
impl Compressor for LlmCompressor {
    async fn summarize(&self, text: &str) -> Result<String> {
        let prompt = format!(
            "You are a professional text compressor. Compress the message to 1-2 sentences, \
             keeping the key facts and the emotional tone.\n\
             No introductions or explanations. First person.\n\n\
             Message:\n{}\n\nCompressed message:",
            text
        );
        Ok(self.ask(prompt).await?.trim().to_string())
    }

    async fn extract_fact(&self, text: &str, date: NaiveDate) -> Result<String> {
        let prompt = format!(
            "You compress information for long-term memory. Extract ONLY ONE, the most \
             important fact from the message, following these rules:\n\
             1. Drop any address to the other party\n\
             2. Drop any reaction to what the other party said\n\
             3. Keep only the key fact\n\
             4. Format: one short statement, no explanations\n\n\
             Recorded on: {}\n\
             Message: {}\n\nExtracted fact:",
            date, text
        );
        let fact = self.ask(prompt).await?;
        Ok(strip_quotes(fact.trim()).to_string())
    }
}

/// Remove one pair of surrounding quotes
fn strip_quotes(text: &str) -> &str {
    let quoted = |c: char| c == '"' || c == '\'';
    let mut chars = text.chars();
    match (chars.next(), chars.next_back()) {
        (Some(first), Some(last)) if quoted(first) && quoted(last) => {
            &text[first.len_utf8()..text.len() - last.len_utf8()]
        }
        _ => text,
    }
}
