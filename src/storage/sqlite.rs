//! SQLite storage: the relational source of truth for both tiers

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{ContextEntry, LongTermFact, Role};

/// SQLite storage backend
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open the database named in the config
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(config.sqlite_path())
    }

    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    // --- context_memory ---

    /// Insert a context row; `summary` is stored as given (already stamped)
    pub fn insert_context(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<ContextEntry> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO context_memory (user_id, role, content, summary, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                user_id,
                role.as_str(),
                content,
                summary,
                format_timestamp(timestamp),
            ],
        )?;

        Ok(ContextEntry {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            role,
            content: content.to_string(),
            summary: summary.to_string(),
            timestamp,
        })
    }

    /// The newest `limit` turns for a user, oldest first
    pub fn recent_context(&self, user_id: &str, limit: usize) -> Result<Vec<ContextEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, role, content, summary, timestamp
            FROM context_memory WHERE user_id = ?1
            ORDER BY timestamp DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], ContextRow::read)?;

        let mut entries = rows
            .map(|row| row?.into_entry())
            .collect::<Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }

    /// Every context turn for a user, in insertion order
    pub fn full_context(&self, user_id: &str) -> Result<Vec<ContextEntry>> {
        self.query_context(
            "SELECT id, user_id, role, content, summary, timestamp FROM context_memory WHERE user_id = ?1 ORDER BY id",
            Some(user_id),
        )
    }

    /// Every context turn for every user, in insertion order
    pub fn all_context(&self) -> Result<Vec<ContextEntry>> {
        self.query_context(
            "SELECT id, user_id, role, content, summary, timestamp FROM context_memory ORDER BY id",
            None,
        )
    }

    fn query_context(&self, sql: &str, user_id: Option<&str>) -> Result<Vec<ContextEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = match user_id {
            Some(user_id) => stmt.query_map(params![user_id], ContextRow::read)?,
            None => stmt.query_map([], ContextRow::read)?,
        };
        let entries: Result<Vec<_>> = rows.map(|row| row?.into_entry()).collect();
        entries
    }

    /// Delete all context rows for a user
    pub fn delete_context(&self, user_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM context_memory WHERE user_id = ?1", params![user_id])?)
    }

    /// Delete the given context rows of a user in one transaction
    pub fn delete_context_rows(&self, user_id: &str, ids: &[i64]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt =
                tx.prepare("DELETE FROM context_memory WHERE user_id = ?1 AND id = ?2")?;
            for id in ids {
                deleted += stmt.execute(params![user_id, id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Delete a single context row by id
    pub fn delete_context_row(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM context_memory WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn count_context(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM context_memory", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    // --- long_term_memory ---

    /// Insert a long-term fact
    pub fn insert_fact(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: &str,
        date: NaiveDate,
        rate: u8,
    ) -> Result<LongTermFact> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO long_term_memory (user_id, role, content, summary, date, rate)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![user_id, role.as_str(), content, summary, date.to_string(), rate],
        )?;

        Ok(LongTermFact {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            role,
            content: content.to_string(),
            summary: summary.to_string(),
            date,
            rate,
        })
    }

    /// Look up a fact by its exact summary
    pub fn find_fact(&self, user_id: &str, summary: &str) -> Result<Option<LongTermFact>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, user_id, role, content, summary, date, rate
                FROM long_term_memory WHERE user_id = ?1 AND summary = ?2
                ORDER BY id LIMIT 1
                "#,
                params![user_id, summary],
                FactRow::read,
            )
            .optional()?;
        row.map(FactRow::into_fact).transpose()
    }

    /// Every fact for a user, in insertion order
    pub fn facts(&self, user_id: &str) -> Result<Vec<LongTermFact>> {
        self.query_facts(
            "SELECT id, user_id, role, content, summary, date, rate FROM long_term_memory WHERE user_id = ?1 ORDER BY id",
            Some(user_id),
        )
    }

    /// Every fact for every user, in insertion order
    pub fn all_facts(&self) -> Result<Vec<LongTermFact>> {
        self.query_facts(
            "SELECT id, user_id, role, content, summary, date, rate FROM long_term_memory ORDER BY id",
            None,
        )
    }

    fn query_facts(&self, sql: &str, user_id: Option<&str>) -> Result<Vec<LongTermFact>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = match user_id {
            Some(user_id) => stmt.query_map(params![user_id], FactRow::read)?,
            None => stmt.query_map([], FactRow::read)?,
        };
        let facts: Result<Vec<_>> = rows.map(|row| row?.into_fact()).collect();
        facts
    }

    /// Delete the facts with this exact summary
    pub fn delete_fact(&self, user_id: &str, summary: &str) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM long_term_memory WHERE user_id = ?1 AND summary = ?2",
            params![user_id, summary],
        )?)
    }

    /// Delete a single fact row by id
    pub fn delete_fact_row(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM long_term_memory WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Set the rating of the facts with this exact summary
    pub fn update_rate(&self, user_id: &str, summary: &str, rate: u8) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE long_term_memory SET rate = ?1 WHERE user_id = ?2 AND summary = ?3",
            params![rate, user_id, summary],
        )?)
    }

    pub fn count_facts(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM long_term_memory", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Every user with at least one row in either tier
    pub fn known_users(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id FROM context_memory
            UNION
            SELECT user_id FROM long_term_memory
            ORDER BY user_id
            "#,
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Error::from)
    }
}

/// Timestamps are stored in one fixed RFC 3339 shape so they sort as text
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Intermediate struct for reading context rows
struct ContextRow {
    id: i64,
    user_id: String,
    role: String,
    content: String,
    summary: String,
    timestamp: String,
}

impl ContextRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            summary: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_entry(self) -> Result<ContextEntry> {
        Ok(ContextEntry {
            id: self.id,
            user_id: self.user_id,
            role: self.role.parse()?,
            content: self.content,
            summary: self.summary,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::storage(e.to_string()))?,
        })
    }
}

/// Intermediate struct for reading long-term rows
struct FactRow {
    id: i64,
    user_id: String,
    role: String,
    content: String,
    summary: String,
    date: String,
    rate: i64,
}

impl FactRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            role: row.get(2)?,
            content: row.get(3)?,
            summary: row.get(4)?,
            date: row.get(5)?,
            rate: row.get(6)?,
        })
    }

    fn into_fact(self) -> Result<LongTermFact> {
        Ok(LongTermFact {
            id: self.id,
            user_id: self.user_id,
            role: self.role.parse()?,
            content: self.content,
            summary: self.summary,
            date: self
                .date
                .parse()
                .map_err(|e: chrono::ParseError| Error::storage(e.to_string()))?,
            rate: u8::try_from(self.rate.clamp(0, 10)).unwrap_or(0),
        })
    }
}
