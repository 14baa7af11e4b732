//! Exchange repository

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::DbPool;
use crate::{Error, Result};

/// One question and the reply that was spoken for it
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub id: String,
    pub session_id: String,
    pub question: String,
    pub answer: String,
    /// Locale, timezone and similar context at the time of the exchange
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Exchange repository
#[derive(Clone)]
pub struct ExchangeRepo {
    pool: DbPool,
}

impl ExchangeRepo {
    /// Create a new exchange repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Store a completed exchange
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record(
        &self,
        session_id: &str,
        question: &str,
        answer: &str,
        metadata: &serde_json::Value,
    ) -> Result<Exchange> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        conn.execute(
            "INSERT INTO exchanges (id, session_id, question, answer, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id,
                session_id,
                question,
                answer,
                serde_json::to_string(metadata)?,
                created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;

        tracing::debug!(id, session_id, "exchange recorded");

        Ok(Exchange {
            id,
            session_id: session_id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            metadata: metadata.clone(),
            created_at,
        })
    }

    /// Most recent exchanges across all sessions, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(&self, limit: usize) -> Result<Vec<Exchange>> {
        self.query(
            "SELECT id, session_id, question, answer, metadata, created_at
             FROM exchanges ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            rusqlite::params![i64::try_from(limit).unwrap_or(i64::MAX)],
        )
    }

    /// Exchanges of one session, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn for_session(&self, session_id: &str) -> Result<Vec<Exchange>> {
        self.query(
            "SELECT id, session_id, question, answer, metadata, created_at
             FROM exchanges WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
            rusqlite::params![session_id],
        )
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Exchange>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn.prepare(sql)?;
        let exchanges = stmt
            .query_map(params, |row| {
                Ok(Exchange {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    question: row.get(2)?,
                    answer: row.get(3)?,
                    metadata: parse_metadata(&row.get::<_, String>(4)?),
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            })?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(exchanges)
    }
}

fn parse_metadata(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

/// Parse an RFC 3339 timestamp, falling back to `SQLite`'s datetime format
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::init_memory;

    fn repo() -> ExchangeRepo {
        ExchangeRepo::new(init_memory().unwrap())
    }

    #[test]
    fn test_record_and_list_recent() {
        let repo = repo();
        let meta = serde_json::json!({ "locale": "en-AU" });

        repo.record("s1", "what's on my list", "Milk and eggs.", &meta)
            .unwrap();
        repo.record("s1", "thanks", "You're welcome.", &meta).unwrap();

        let recent = repo.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].question, "thanks");
        assert_eq!(recent[1].metadata["locale"], "en-AU");
    }

    #[test]
    fn test_recent_respects_limit() {
        let repo = repo();
        for i in 0..5 {
            repo.record("s1", &format!("q{i}"), "a", &serde_json::json!({}))
                .unwrap();
        }
        assert_eq!(repo.recent(3).unwrap().len(), 3);
    }

    #[test]
    fn test_for_session_filters_and_orders() {
        let repo = repo();
        let meta = serde_json::json!({});
        repo.record("s1", "first", "a", &meta).unwrap();
        repo.record("s2", "other", "b", &meta).unwrap();
        repo.record("s1", "second", "c", &meta).unwrap();

        let questions: Vec<_> = repo
            .for_session("s1")
            .unwrap()
            .into_iter()
            .map(|e| e.question)
            .collect();
        assert_eq!(questions, ["first", "second"]);
    }

    #[test]
    fn test_parse_datetime_formats() {
        let dt = parse_datetime("2024-01-15 10:30:00");
        assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");
        let dt = parse_datetime("2024-01-15T10:30:00+00:00");
        assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }
}
