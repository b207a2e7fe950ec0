//! LLM Router - Quota-aware routing across two completion providers
//!
//! This crate routes natural-language completion requests between a
//! daily-capped free-tier provider (Gemini) and a credit-based one
//! (OpenAI), tracking per-day consumption, throttling client-side, and
//! failing over at most once per request.
//!
//! # Configuration-Driven Design
//!
//! Provider keys and tuning come from the environment, not code:
//!
//! ```bash
//! export GEMINI_API_KEY=...
//! export OPENAI_API_KEY=...
//! export LLM_ROUTER_QUOTA_PATH=~/.cache/llm-router/quota.json
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use llm_router::create_router;
//!
//! let router = create_router().await;
//! let text = router.complete("Summarize this in one line: ...").await?;
//! ```

use std::sync::Arc;

// =============================================================================
// Internal Modules
// =============================================================================

mod api;
mod config;
mod core;
mod spi;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// =============================================================================
// Public API - Types & Errors (from api/)
// =============================================================================

pub use api::{
    // Types
    Outcome, Priority, ProviderId, QuotaStatus, ThrottleReason, ThrottleStatus,
    // Errors
    RouterError, RouterResult,
};

// =============================================================================
// Public API - Configuration
// =============================================================================

pub use config::keys;
pub use config::{ProviderProfile, RouterConfig};

// =============================================================================
// Public API - SPI Traits & Implementations (from spi/)
// =============================================================================

pub use spi::{CompletionBackend, KeySource, QuotaStore};
pub use spi::{EnvKeySource, FileQuotaStore, GeminiBackend, MemoryQuotaStore, OpenAiBackend};

// =============================================================================
// Public API - Routing Core (from core/)
// =============================================================================

pub use crate::core::{CompletionRouter, QuotaTracker, ThrottleController};

#[cfg(any(test, feature = "testing"))]
pub use testing::{MockBackend, StaticKeySource};

// =============================================================================
// Factory Functions
// =============================================================================

/// Create a router configured from the environment
///
/// Reads provider keys from `GEMINI_API_KEY` / `OPENAI_API_KEY` on every
/// request, so keys added after startup are picked up. Quota records
/// persist to `LLM_ROUTER_QUOTA_PATH` when set, otherwise stay in memory.
pub async fn create_router() -> CompletionRouter {
    create_router_from_config(RouterConfig::from_env()).await
}

/// Create a router from explicit configuration
pub async fn create_router_from_config(config: RouterConfig) -> CompletionRouter {
    RouterBuilder::new().with_config(config).build().await
}

/// Create a builder for custom wiring
///
/// # Example
/// ```rust,ignore
/// use llm_router::{router_builder, RouterConfig};
///
/// let router = router_builder()
///     .with_config(RouterConfig::from_env())
///     .with_quota_store(my_store)
///     .build()
///     .await;
/// ```
pub fn router_builder() -> RouterBuilder {
    RouterBuilder::new()
}

/// Builder for routers with swapped-out collaborators
///
/// Every collaborator defaults to the production implementation: HTTP
/// backends, environment-variable keys, and a file or memory quota store
/// depending on configuration.
pub struct RouterBuilder {
    config: RouterConfig,
    keys: Option<Arc<dyn KeySource>>,
    store: Option<Arc<dyn QuotaStore>>,
    primary: Option<Arc<dyn CompletionBackend>>,
    secondary: Option<Arc<dyn CompletionBackend>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
            keys: None,
            store: None,
            primary: None,
            secondary: None,
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_key_source(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_quota_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_primary_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.primary = Some(backend);
        self
    }

    pub fn with_secondary_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.secondary = Some(backend);
        self
    }

    /// Build the router and start its background sweeper
    pub async fn build(self) -> CompletionRouter {
        let config = self.config;

        let keys = self.keys.unwrap_or_else(|| {
            Arc::new(EnvKeySource::new(
                config.primary.api_key_env.clone(),
                config.secondary.api_key_env.clone(),
            ))
        });
        let store = self.store.unwrap_or_else(|| match &config.quota_path {
            Some(path) => Arc::new(FileQuotaStore::new(path)) as Arc<dyn QuotaStore>,
            None => Arc::new(MemoryQuotaStore::new()),
        });
        let primary = self
            .primary
            .unwrap_or_else(|| Arc::new(GeminiBackend::new(&config.primary)));
        let secondary = self
            .secondary
            .unwrap_or_else(|| Arc::new(OpenAiBackend::new(&config.secondary)));

        let quota = Arc::new(QuotaTracker::new(store, config.clone()));
        let throttle = ThrottleController::new(config.clone());
        throttle.spawn_sweeper();

        tracing::debug!(
            primary = %config.primary.model,
            secondary = %config.secondary.model,
            "Router built"
        );
        CompletionRouter::new(primary, secondary, keys, quota, throttle, config)
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
