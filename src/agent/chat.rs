//! OpenAI-compatible chat-completions pipeline

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{ConversationContext, ResponsePipeline};
use crate::{Error, Result};

/// Spoken when the model returns no content
pub const FALLBACK_REPLY: &str = "Sorry, I couldn't come up with an answer to that.";

/// Calls `{base_url}/chat/completions`
pub struct ChatCompletionPipeline {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    model: String,
    system_prompt: String,
    max_tokens: u32,
}

impl ChatCompletionPipeline {
    /// Create a pipeline
    ///
    /// `api_key` may be omitted for local servers that do not check it.
    #[must_use]
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        model: String,
        system_prompt: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            system_prompt,
            max_tokens,
        }
    }

    fn build_request<'a>(&'a self, text: &'a str, context: &'a ConversationContext) -> ChatRequest<'a> {
        let system = format!(
            "{}\n\n{}",
            self.system_prompt,
            context.user_context_block(Utc::now())
        );

        let mut messages = vec![ChatMessage {
            role: "system",
            content: system.into(),
        }];
        messages.extend(context.history().map(|turn| ChatMessage {
            role: turn.role.as_str(),
            content: turn.content.as_str().into(),
        }));
        messages.push(ChatMessage {
            role: "user",
            content: text.into(),
        });

        ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl ResponsePipeline for ChatCompletionPipeline {
    async fn respond(&self, text: &str, context: &ConversationContext) -> Result<String> {
        let request = self.build_request(text, context);

        tracing::debug!(
            model = %self.model,
            turns = context.len(),
            "requesting reply"
        );

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Response(format!("chat request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Response(format!("chat API error {status}: {body}")));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Response(format!("failed to parse chat response: {e}")))?;

        Ok(reply_text(result))
    }
}

fn reply_text(response: ChatResponse) -> String {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    if content.is_empty() {
        tracing::warn!("model returned no content, using fallback reply");
        FALLBACK_REPLY.to_string()
    } else {
        content
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: std::borrow::Cow<'a, str>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
