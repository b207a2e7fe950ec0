//! Router SPI - traits for the system's external collaborators
//!
//! Three boundaries, each an object-safe async trait so tests can swap in
//! fakes:
//! - [`CompletionBackend`]: one provider's HTTP completion endpoint. The
//!   adapter owns request shaping and classifies the raw response into an
//!   [`Outcome`] at the edge; the dispatcher never sees provider payloads.
//! - [`KeySource`]: "current key for provider X, or none". How keys are
//!   stored or merged across tiers is outside this crate.
//! - [`QuotaStore`]: a key-value blob store that survives process restarts.

mod gemini;
mod openai;
mod store;

pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;
pub use store::{FileQuotaStore, MemoryQuotaStore};

use async_trait::async_trait;

use crate::api::{Outcome, ProviderId, RouterResult};

/// One provider's completion endpoint
///
/// Implementations must be `Send + Sync`; the router holds them behind
/// `Arc<dyn CompletionBackend>`.
#[async_trait]
pub trait CompletionBackend: Send + Sync + std::fmt::Debug {
    /// Which router slot this backend fills
    fn id(&self) -> ProviderId;

    /// Model id requests are issued against
    fn model(&self) -> &str;

    /// Issue one completion attempt and classify the result
    ///
    /// Never returns an error: every failure mode maps to an [`Outcome`]
    /// variant so downstream policy stays table-driven.
    async fn invoke(&self, prompt: &str, api_key: &str) -> Outcome;
}

/// Source of provider API keys
#[async_trait]
pub trait KeySource: Send + Sync + std::fmt::Debug {
    /// Current key for the provider, or `None` when unconfigured
    async fn key_for(&self, provider: ProviderId) -> Option<String>;
}

/// Key source backed by process environment variables
///
/// Reads the variable named in each provider's profile on every call, so
/// keys set after startup are picked up without a restart.
#[derive(Debug, Clone)]
pub struct EnvKeySource {
    primary_env: String,
    secondary_env: String,
}

impl EnvKeySource {
    pub fn new(primary_env: impl Into<String>, secondary_env: impl Into<String>) -> Self {
        Self {
            primary_env: primary_env.into(),
            secondary_env: secondary_env.into(),
        }
    }
}

#[async_trait]
impl KeySource for EnvKeySource {
    async fn key_for(&self, provider: ProviderId) -> Option<String> {
        let var = match provider {
            ProviderId::Primary => &self.primary_env,
            ProviderId::Secondary => &self.secondary_env,
        };
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => None,
        }
    }
}

/// Persistent key-value store for quota records
#[async_trait]
pub trait QuotaStore: Send + Sync + std::fmt::Debug {
    /// Read the blob stored under `key`, if any
    async fn load(&self, key: &str) -> RouterResult<Option<String>>;

    /// Write `value` under `key`, replacing any previous blob
    async fn save(&self, key: &str, value: &str) -> RouterResult<()>;
}
