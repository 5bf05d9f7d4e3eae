//! Record types for the two memory tiers

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Format of the human-readable stamp prefixed to context summaries
const STAMP_FORMAT: &str = "%d.%m %H:%M";

/// Role of a turn's author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Label used when a turn is echoed back into a prompt
    pub fn speaker(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "You",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::storage(format!("Unknown role: {}", other))),
        }
    }
}

/// A single short-term turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Relational row id
    pub id: i64,

    pub user_id: String,

    pub role: Role,

    /// Raw turn text
    pub content: String,

    /// Compressed text, prefixed with `[dd.mm HH:MM]`
    pub summary: String,

    pub timestamp: DateTime<Utc>,
}

impl ContextEntry {
    /// Calendar date the turn was recorded on
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// A durable, importance-rated fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermFact {
    /// Relational row id
    pub id: i64,

    pub user_id: String,

    pub role: Role,

    /// Raw text of the turn the fact was promoted from
    pub content: String,

    /// The compressed fact itself
    pub summary: String,

    pub date: NaiveDate,

    /// Importance rating, 0-10
    pub rate: u8,
}

impl LongTermFact {
    /// Whether the fact belongs to the tier that is never re-scored
    pub fn is_eternal(&self, eternal_rating: u8) -> bool {
        self.rate >= eternal_rating
    }
}

/// Human-readable stamp for a moment, e.g. `18.10 14:05`
pub fn readable_stamp(at: DateTime<Utc>) -> String {
    at.format(STAMP_FORMAT).to_string()
}

/// Prefix a summary with the stamp of the moment it was recorded
pub fn stamp_summary(at: DateTime<Utc>, summary: &str) -> String {
    format!("[{}]{}", readable_stamp(at), summary)
}

/// Remove a leading `[...]` stamp, if present
pub fn strip_stamp(summary: &str) -> &str {
    if summary.starts_with('[') {
        if let Some(end) = summary.find(']') {
            return &summary[end + 1..];
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stamp_round_trips_through_strip() {
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 9, 5, 0).unwrap();
        let stamped = stamp_summary(at, "likes cats");
        assert_eq!(stamped, "[07.03 09:05]likes cats");
        assert_eq!(strip_stamp(&stamped), "likes cats");
    }

    #[test]
    fn strip_leaves_unstamped_text_alone() {
        assert_eq!(strip_stamp("no stamp here"), "no stamp here");
        assert_eq!(strip_stamp("[unterminated"), "[unterminated");
    }

    #[test]
    fn role_parses_its_own_display() {
        for role in [Role::User, Role::Assistant] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("system".parse::<Role>().is_err());
    }
}
