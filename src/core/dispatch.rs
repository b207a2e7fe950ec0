//! Request dispatch: provider selection, one-hop failover, outcome policy
//!
//! [`CompletionRouter::complete`] is the whole public surface of routing:
//! pick a provider, pace the request through the throttle, classify what
//! came back, and either return text, fail over exactly once, or surface a
//! terminal error. Capacity problems (quota, rate limits) trigger the hop;
//! everything else is the caller's problem and returns immediately.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::{Outcome, ProviderId, QuotaStatus, RouterError, RouterResult, ThrottleStatus};
use crate::config::RouterConfig;
use crate::core::quota::QuotaTracker;
use crate::core::throttle::ThrottleController;
use crate::spi::{CompletionBackend, KeySource};

/// Flag duration assumed for a credit-based provider that reported
/// exhaustion without a reset time. Credits may be topped up any time, so
/// re-probing hourly is cheap and bounded.
const CREDIT_QUOTA_RETRY_SECS: u64 = 3600;

/// At most one failover hop per request
const MAX_ATTEMPTS: u32 = 2;

/// Routes completion requests across the two providers
pub struct CompletionRouter {
    primary: Arc<dyn CompletionBackend>,
    secondary: Arc<dyn CompletionBackend>,
    keys: Arc<dyn KeySource>,
    quota: Arc<QuotaTracker>,
    throttle: ThrottleController,
    config: RouterConfig,
    preferred: RwLock<Option<ProviderId>>,
}

impl CompletionRouter {
    pub fn new(
        primary: Arc<dyn CompletionBackend>,
        secondary: Arc<dyn CompletionBackend>,
        keys: Arc<dyn KeySource>,
        quota: Arc<QuotaTracker>,
        throttle: ThrottleController,
        config: RouterConfig,
    ) -> Self {
        let preferred = config.preferred;
        Self {
            primary,
            secondary,
            keys,
            quota,
            throttle,
            config,
            preferred: RwLock::new(preferred),
        }
    }

    fn backend(&self, provider: ProviderId) -> Arc<dyn CompletionBackend> {
        match provider {
            ProviderId::Primary => Arc::clone(&self.primary),
            ProviderId::Secondary => Arc::clone(&self.secondary),
        }
    }

    /// Complete `prompt` against whichever provider policy selects
    ///
    /// Performs at most [`MAX_ATTEMPTS`] network attempts: the selected
    /// provider, plus one hop to the other when the first hit a capacity
    /// limit and the other looks usable. Never retries the same provider
    /// within a call.
    pub async fn complete(&self, prompt: &str) -> RouterResult<String> {
        let primary_key = self.keys.key_for(ProviderId::Primary).await;
        let secondary_key = self.keys.key_for(ProviderId::Secondary).await;
        if primary_key.is_none() && secondary_key.is_none() {
            return Err(RouterError::NoKeysConfigured);
        }
        let key_for = |provider: ProviderId| match provider {
            ProviderId::Primary => primary_key.clone(),
            ProviderId::Secondary => secondary_key.clone(),
        };

        let mut provider = self
            .choose_provider(primary_key.is_some(), secondary_key.is_some())
            .await?;

        let mut attempts = 0;
        loop {
            let key = match key_for(provider) {
                Some(key) => key,
                None => return Err(self.exhausted_error().await),
            };

            attempts += 1;
            let outcome = self.attempt(provider, prompt, &key).await;
            match outcome {
                Outcome::Success(text) => {
                    debug!(provider = %provider, attempts, "Completion succeeded");
                    return Ok(text);
                }
                Outcome::AuthError(message) => {
                    return Err(RouterError::Auth { provider, message });
                }
                Outcome::MalformedRequest(message) => {
                    return Err(RouterError::MalformedRequest { provider, message });
                }
                Outcome::NetworkError(message) => {
                    return Err(RouterError::Network { provider, message });
                }
                Outcome::ProviderError(message) => {
                    return Err(RouterError::Provider { provider, message });
                }
                Outcome::QuotaExceeded { retry_after_secs } => {
                    let retry = retry_after_secs
                        .unwrap_or_else(|| self.default_quota_retry_secs(provider));
                    self.quota
                        .record_quota_exceeded(provider, Some(retry))
                        .await;
                }
                Outcome::RateLimited { retry_after_secs } => {
                    // A rate limit with an explicit reset time is treated
                    // like exhaustion until that time; a bare one only
                    // triggers the hop.
                    if let Some(secs) = retry_after_secs {
                        self.quota
                            .record_quota_exceeded(provider, Some(secs))
                            .await;
                    }
                }
            }

            // Capacity outcome: consider the single failover hop.
            if attempts >= MAX_ATTEMPTS {
                return Err(self.exhausted_error().await);
            }
            let other = provider.other();
            if key_for(other).is_none() || self.quota.is_likely_over_quota(other).await {
                warn!(provider = %provider, "Capacity exhausted with no usable fallback");
                return Err(self.exhausted_error().await);
            }
            info!(from = %provider, to = %other, "Failing over");
            provider = other;
        }
    }

    /// One paced network attempt, counted against the day's quota
    async fn attempt(&self, provider: ProviderId, prompt: &str, key: &str) -> Outcome {
        self.quota.record_request_attempt(provider).await;
        let backend = self.backend(provider);
        let prompt = prompt.to_string();
        let key = key.to_string();
        self.throttle
            .throttled_request(provider, async move { backend.invoke(&prompt, &key).await })
            .await
    }

    /// A pinned provider wins when it is usable; otherwise fall back to the
    /// quota tracker's recommendation
    async fn choose_provider(
        &self,
        has_primary_key: bool,
        has_secondary_key: bool,
    ) -> RouterResult<ProviderId> {
        if let Some(pinned) = *self.preferred.read().await {
            let has_key = match pinned {
                ProviderId::Primary => has_primary_key,
                ProviderId::Secondary => has_secondary_key,
            };
            if has_key && !self.quota.is_likely_over_quota(pinned).await {
                debug!(provider = %pinned, "Using pinned provider");
                return Ok(pinned);
            }
        }

        match self
            .quota
            .recommended_provider(has_primary_key, has_secondary_key)
            .await
        {
            Some(provider) => Ok(provider),
            None => Err(self.exhausted_error().await),
        }
    }

    fn default_quota_retry_secs(&self, provider: ProviderId) -> u64 {
        if self.config.profile(provider).is_daily_capped() {
            secs_until_next_local_midnight()
        } else {
            CREDIT_QUOTA_RETRY_SECS
        }
    }

    async fn exhausted_error(&self) -> RouterError {
        let detail = self
            .quota
            .all_quota_status()
            .await
            .iter()
            .map(|s| match s.limit {
                Some(limit) => format!("{} {}/{}", s.provider, s.count, limit),
                None => format!("{} {} used", s.provider, s.count),
            })
            .collect::<Vec<_>>()
            .join(", ");
        RouterError::AllProvidersExhausted { detail }
    }

    /// Pin all routing to one provider, or `None` to restore policy routing
    pub async fn set_preferred_provider(&self, provider: Option<ProviderId>) {
        *self.preferred.write().await = provider;
        info!(provider = ?provider, "Preferred provider updated");
    }

    pub async fn quota_status(&self, provider: ProviderId) -> QuotaStatus {
        self.quota.quota_status(provider).await
    }

    pub async fn all_quota_status(&self) -> Vec<QuotaStatus> {
        self.quota.all_quota_status().await
    }

    pub async fn clear_quota_exceeded(&self, provider: ProviderId) {
        self.quota.clear_quota_exceeded(provider).await;
    }

    pub async fn throttle_status(&self, provider: ProviderId) -> ThrottleStatus {
        self.throttle.throttle_status(provider).await
    }

    /// Stop background tasks; in-flight completions finish normally
    pub fn shutdown(&self) {
        self.throttle.shutdown();
    }
}

/// Whole seconds until the next local midnight, when daily caps reset
fn secs_until_next_local_midnight() -> u64 {
    let now = Local::now();
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|dt| dt.and_local_timezone(Local).earliest());
    match next {
        Some(next) => (next - now).num_seconds().max(1) as u64,
        None => 24 * 3600,
    }
}
