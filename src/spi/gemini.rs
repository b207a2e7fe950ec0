//! Gemini backend adapter (primary, daily-capped slot)

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::CompletionBackend;
use crate::api::{Outcome, ProviderId};
use crate::config::ProviderProfile;

const REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Adapter for the Gemini `generateContent` endpoint
///
/// Holds no key material; the dispatcher passes the current key per call.
#[derive(Debug)]
pub struct GeminiBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl GeminiBackend {
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
impl CompletionBackend for GeminiBackend {
    fn id(&self) -> ProviderId {
        ProviderId::Primary
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, prompt: &str, api_key: &str) -> Outcome {
        debug!(model = %self.model, "Gemini generateContent");

        let request = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
        };

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
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

        let parsed: Result<GeminiResponse, _> = response.json().await;
        match parsed {
            Ok(body) => match body.text() {
                Some(text) => Outcome::Success(text),
                None => Outcome::ProviderError("response contained no candidates".to_string()),
            },
            Err(e) => Outcome::ProviderError(format!("unparseable response: {}", e)),
        }
    }
}

/// Map an HTTP status plus error body to an outcome
///
/// Gemini signals quota exhaustion as a 429 whose payload carries the
/// `RESOURCE_EXHAUSTED` status and, when the cap resets on a schedule, a
/// `RetryInfo.retryDelay` detail. A 429 without quota language is ordinary
/// throttling.
fn classify(status: u16, body: &str, retry_after_secs: Option<u64>) -> Outcome {
    match status {
        401 | 403 => Outcome::AuthError(truncate(body)),
        400 => Outcome::MalformedRequest(truncate(body)),
        429 => {
            if body.contains("RESOURCE_EXHAUSTED") || body.to_lowercase().contains("quota") {
                Outcome::QuotaExceeded {
                    retry_after_secs: retry_after_secs.or_else(|| parse_retry_delay(body)),
                }
            } else {
                Outcome::RateLimited {
                    retry_after_secs: retry_after_secs.or_else(|| parse_retry_delay(body)),
                }
            }
        }
        _ => Outcome::ProviderError(format!("HTTP {}: {}", status, truncate(body))),
    }
}

/// Extract a whole-second Retry-After value, if the header carries one
fn retry_after_header(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Parse `"retryDelay": "32s"` out of a RetryInfo error detail
fn parse_retry_delay(body: &str) -> Option<u64> {
    let idx = body.find("retryDelay")?;
    let rest = &body[idx..];
    let colon = rest.find(':')?;
    let value = rest[colon + 1..]
        .trim_start()
        .trim_start_matches('"')
        .split(|c: char| !c.is_ascii_digit())
        .next()?;
    value.parse().ok()
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

// Gemini API types

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

impl GeminiResponse {
    fn text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let joined = candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        if joined.is_empty() {
            None
        } else {
            Some(joined)
        }
    }
}
