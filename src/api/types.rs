use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for one of the two configured completion providers
///
/// `Primary` is the daily-capped (free-tier) backend, `Secondary` the
/// credit-based one. The pairing is fixed at build time; which concrete
/// service each maps to comes from [`crate::config::ProviderProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Primary,
    Secondary,
}

impl ProviderId {
    /// The other provider, used for single-hop failover
    pub fn other(self) -> Self {
        match self {
            ProviderId::Primary => ProviderId::Secondary,
            ProviderId::Secondary => ProviderId::Primary,
        }
    }

    /// Stable lowercase identifier for logs and status payloads
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Primary => "primary",
            ProviderId::Secondary => "secondary",
        }
    }

    /// Both providers in a fixed order
    pub fn all() -> [ProviderId; 2] {
        [ProviderId::Primary, ProviderId::Secondary]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one completed network attempt
///
/// Every policy decision downstream of a provider call (retry, fail over,
/// surface to the caller) is table-driven from this. Adapters map their raw
/// HTTP responses into it once, at the edge, so the dispatcher never
/// inspects provider-specific payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Completion succeeded; carries the generated text
    Success(String),
    /// Bad or revoked API key (401/403)
    AuthError(String),
    /// Provider rejected the request shape (400)
    MalformedRequest(String),
    /// Transient provider-side throttling (bare 429)
    RateLimited { retry_after_secs: Option<u64> },
    /// Quota model exhausted (429 with a quota-bearing payload)
    QuotaExceeded { retry_after_secs: Option<u64> },
    /// Connectivity failure before a classifiable response arrived
    NetworkError(String),
    /// Uncategorized non-2xx (typically 5xx)
    ProviderError(String),
}

impl Outcome {
    /// True for outcomes recovered by failing over to the other provider
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Outcome::RateLimited { .. } | Outcome::QuotaExceeded { .. }
        )
    }

    /// Short stable label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::AuthError(_) => "auth_error",
            Outcome::MalformedRequest(_) => "malformed_request",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::QuotaExceeded { .. } => "quota_exceeded",
            Outcome::NetworkError(_) => "network_error",
            Outcome::ProviderError(_) => "provider_error",
        }
    }
}

/// Point-in-time quota view for one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub provider: ProviderId,
    /// Requests attempted today
    pub count: u32,
    /// Daily cap, when the provider has one
    pub limit: Option<u32>,
    pub quota_exceeded: bool,
    pub retry_after: Option<DateTime<Utc>>,
    /// True when no retry-after is set or it has passed
    pub can_retry: bool,
    /// count / limit, for capped providers
    pub percentage: Option<f64>,
}

/// Why a request is being held back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Trailing 60 s window is at the per-minute ceiling
    RateLimit,
    /// In-flight count is at the concurrency ceiling
    ConcurrentLimit,
}

/// Read-only throttle diagnostics for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleStatus {
    pub provider: ProviderId,
    /// Requests started within the trailing 60 s window
    pub recent_requests: u32,
    pub requests_per_minute: u32,
    /// Fraction of the window consumed, 0.0 to 1.0
    pub utilization: f64,
    pub active: u32,
    pub max_concurrent: u32,
}

/// Queue priority for admission-controlled requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}
