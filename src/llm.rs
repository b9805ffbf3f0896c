//! Natural-language service client and the primary/fallback helper.
//!
//! Every call site goes through [`with_fallback`]: the service reply is only
//! used when it arrives in time and parses; otherwise the deterministic rule
//! path produces a value of the same type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("empty reply")]
    Empty,
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Text-in, text-out completion service.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Primary,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub source: Source,
}

/// Try the service, fall back to `fallback` on any failure.
///
/// `label` only names the call site in logs.
pub async fn with_fallback<T, P, F>(
    client: Option<&dyn LlmClient>,
    timeout: Duration,
    label: &str,
    prompt: &str,
    parse: P,
    fallback: F,
) -> Outcome<T>
where
    P: FnOnce(&str) -> Result<T, LlmError>,
    F: FnOnce() -> T,
{
    let Some(client) = client else {
        return Outcome {
            value: fallback(),
            source: Source::Fallback,
        };
    };

    let attempt = match tokio::time::timeout(timeout, client.complete(prompt)).await {
        Ok(Ok(reply)) => parse(&reply),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(LlmError::Timeout(timeout)),
    };

    match attempt {
        Ok(value) => Outcome {
            value,
            source: Source::Primary,
        },
        Err(err) => {
            log::warn!("{}: using rule-based fallback ({})", label, err);
            Outcome {
                value: fallback(),
                source: Source::Fallback,
            }
        }
    }
}

/// The outermost `{...}` span of a reply, ignoring code fences and chatter.
pub fn json_payload(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

// --- OpenAI-compatible chat completions ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatCompletionsClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl ChatCompletionsClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.3,
        })
    }
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::Empty)
    }
}
