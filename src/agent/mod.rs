//! Response pipeline: turns a recognized request into reply text

mod chat;

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;

pub use chat::{ChatCompletionPipeline, FALLBACK_REPLY};

/// Default number of turns kept for context
pub const DEFAULT_HISTORY_TURNS: usize = 10;

/// Produces the reply for a user request
#[async_trait]
pub trait ResponsePipeline: Send + Sync {
    /// Answer `text` given the conversation so far
    ///
    /// # Errors
    ///
    /// Returns `Error::Response` (or a transport error) if no reply could be
    /// produced
    async fn respond(&self, text: &str, context: &ConversationContext) -> Result<String>;
}

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One line of conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Who is talking and where they are
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserContext {
    /// IANA timezone name
    pub timezone: String,
    /// Free-form location, if the user shared one
    pub location: Option<String>,
    /// BCP-47 locale
    pub locale: String,
}

impl Default for UserContext {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            location: None,
            locale: "en-AU".to_string(),
        }
    }
}

/// Everything the pipeline sees besides the request itself
#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub user: UserContext,
    history: VecDeque<Turn>,
    max_turns: usize,
}

impl ConversationContext {
    /// Empty context keeping at most `max_turns` turns
    #[must_use]
    pub fn new(session_id: impl Into<String>, user: UserContext, max_turns: usize) -> Self {
        Self {
            session_id: session_id.into(),
            user,
            history: VecDeque::with_capacity(max_turns),
            max_turns,
        }
    }

    /// Append a turn, dropping the oldest beyond the limit
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        if self.max_turns == 0 {
            return;
        }
        while self.history.len() >= self.max_turns {
            self.history.pop_front();
        }
        self.history.push_back(Turn {
            role,
            content: content.into(),
        });
    }

    /// Append a question and its reply
    pub fn record_exchange(&mut self, question: &str, answer: &str) {
        self.push(Role::User, question);
        self.push(Role::Assistant, answer);
    }

    /// Recent turns, oldest first
    pub fn history(&self) -> impl Iterator<Item = &Turn> {
        self.history.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Context block handed to the model alongside the system prompt
    #[must_use]
    pub fn user_context_block(&self, now: DateTime<Utc>) -> String {
        let mut block = String::from("<user-context>\n");
        block.push_str(&format!("Timezone: {}\n", self.user.timezone));
        if let Some(location) = &self.user.location {
            block.push_str(&format!("Location: {location}\n"));
        }
        block.push_str(&format!("Locale: {}\n", self.user.locale));
        block.push_str(&format!("Current time (UTC): {}\n", now.to_rfc3339()));
        block.push_str("</user-context>");
        block
    }

    /// JSON metadata stored next to each exchange
    #[must_use]
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "timezone": self.user.timezone,
            "location": self.user.location,
            "locale": self.user.locale,
        })
    }
}
