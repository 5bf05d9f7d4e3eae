//! Storage backends for tiered-memory

mod sqlite;
pub mod vector;

pub use sqlite::SqliteStorage;
pub use vector::{RecordMetadata, SearchHit, Tier, VectorIndex};
