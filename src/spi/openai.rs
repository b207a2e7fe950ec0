//! OpenAI backend adapter (secondary, credit-based slot)

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::CompletionBackend;
use crate::api::{Outcome, ProviderId};
use crate::config::ProviderProfile;

const REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Adapter for the OpenAI chat completions endpoint
#[derive(Debug)]
pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(profile: &ProviderProfile) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: profile.base_url.clone(),
            model: profile.model.clone(),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn id(&self) -> ProviderId {
        ProviderId::Secondary
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str, api_key: &str) -> Outcome {
        debug!(model = %self.model, "OpenAI chat completion");

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => return Outcome::NetworkError(e.to_string()),
        };

        let status = response.status().as_u16();
        let retry_after = retry_after_header(response.headers());
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return classify(status, &body, retry_after);
        }

        let parsed: Result<ChatResponse, _> = response.json().await;
        match parsed {
            Ok(body) => match body.text() {
                Some(text) => Outcome::Success(text),
                None => Outcome::ProviderError("response contained no choices".to_string()),
            },
            Err(e) => Outcome::ProviderError(format!("unparseable response: {}", e)),
        }
    }
}

/// Map an HTTP status plus error body to an outcome
///
/// OpenAI distinguishes billing exhaustion from throttling with the
/// `insufficient_quota` error code on an otherwise ordinary 429.
fn classify(status: u16, body: &str, retry_after_secs: Option<u64>) -> Outcome {
    match status {
        401 | 403 => Outcome::AuthError(truncate(body)),
        400 => Outcome::MalformedRequest(truncate(body)),
        429 => {
            if body.contains("insufficient_quota") || body.contains("billing") {
                Outcome::QuotaExceeded {
                    retry_after_secs,
                }
            } else {
                Outcome::RateLimited { retry_after_secs }
            }
        }
        _ => Outcome::ProviderError(format!("HTTP {}: {}", status, truncate(body))),
    }
}

fn retry_after_header(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn truncate(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl ChatResponse {
    fn text(&self) -> Option<String> {
        let content = &self.choices.first()?.message.content;
        if content.is_empty() {
            None
        } else {
            Some(content.clone())
        }
    }
}
