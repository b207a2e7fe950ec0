use thiserror::Error;

use super::types::ProviderId;

/// Router errors surfaced to the caller, with failover classification
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no provider API keys configured; set a key for at least one provider")]
    NoKeysConfigured,

    #[error("all configured providers are exhausted: {detail}")]
    AllProvidersExhausted { detail: String },

    #[error("authentication failed for {provider}: {message}")]
    Auth {
        provider: ProviderId,
        message: String,
    },

    #[error("malformed request rejected by {provider}: {message}")]
    MalformedRequest {
        provider: ProviderId,
        message: String,
    },

    #[error("network error talking to {provider}: {message}")]
    Network {
        provider: ProviderId,
        message: String,
    },

    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: ProviderId,
        message: String,
    },

    #[error("request queue closed before dispatch")]
    QueueClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RouterError {
    /// Check whether this error indicates a capacity problem
    ///
    /// Capacity errors mean every configured provider was out of quota or
    /// rate-limited; they clear on their own once a quota window resets.
    /// Everything else requires the user to fix configuration or input.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            RouterError::AllProvidersExhausted { .. } | RouterError::NoKeysConfigured
        )
    }

    /// The provider this error originated from, when attributable to one
    pub fn provider(&self) -> Option<ProviderId> {
        match self {
            RouterError::Auth { provider, .. }
            | RouterError::MalformedRequest { provider, .. }
            | RouterError::Network { provider, .. }
            | RouterError::Provider { provider, .. } => Some(*provider),
            _ => None,
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
