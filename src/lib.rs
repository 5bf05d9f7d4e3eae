//! # Tiered Memory
//!
//! Per-user conversational memory for an assistant, in two tiers.
//!
//! ## Architecture
//!
//! - **Vector index** - exact inner-product search over unit vectors, persisted
//!   as two companion files and shared by both tiers
//! - **Context** - short-term log of recent turns, searchable by recency or
//!   by meaning
//! - **Long-term** - durable facts rated 0-10 by importance
//! - **Retrieval** - merges matches from both tiers into prior turns for the
//!   reply generator
//! - **Pipeline** - periodic job that promotes important context into
//!   long-term memory, clears the context and lets stale facts decay
//!
//! SQLite holds the rows; the vector index is derived from them and can be
//! rebuilt at any time.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tiered_memory::{Config, MemoryStore, RetrievalComposer, Role};
//! use tiered_memory::embedding::FastEmbedProvider;
//!
//! let config = Config::from_env()?;
//! let embedder = Arc::new(FastEmbedProvider::new(&config)?);
//! let store = MemoryStore::open(config, embedder).await?;
//!
//! // Record a turn
//! store.context().append("alice", Role::User, "I adopted a cat", "adopted a cat").await?;
//!
//! // Recall what matters for a new message
//! let retrieved = RetrievalComposer::for_store(&store).compose("alice", "my cat").await?;
//! let prior_turns = retrieved.prior_turns();
//! ```

pub mod config;
pub mod context;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod long_term;
pub mod memory;
pub mod message;
pub mod pipeline;
pub mod provider;
pub mod retrieval;
pub mod scoring;
pub mod storage;

pub use config::Config;
pub use context::ContextStore;
pub use conversation::TurnHandler;
pub use error::{Error, Result};
pub use long_term::LongTermStore;
pub use memory::MemoryStore;
pub use message::{ContextEntry, LongTermFact, Role};
pub use pipeline::OffloadPipeline;
pub use retrieval::{RetrievalComposer, RetrievalContext};
pub use scoring::{ImportanceScorer, Jitter};
