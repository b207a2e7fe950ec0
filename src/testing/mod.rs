//! Test doubles for the router's SPI traits
//!
//! Available to this crate's own tests and, behind the `testing` feature,
//! to downstream crates that want to exercise routing policy without a
//! network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::api::{Outcome, ProviderId};
use crate::spi::{CompletionBackend, KeySource};

/// Scripted backend: replays a queue of outcomes, then a standing default
///
/// Call counts are observable, so tests can assert exactly how many
/// network attempts a policy produced.
#[derive(Debug)]
pub struct MockBackend {
    id: ProviderId,
    script: Mutex<VecDeque<Outcome>>,
    default: Outcome,
    calls: AtomicU64,
}

impl MockBackend {
    /// A backend that always succeeds
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            script: Mutex::new(VecDeque::new()),
            default: Outcome::Success(format!("mock response from {}", id)),
            calls: AtomicU64::new(0),
        }
    }

    /// Replay `outcomes` in order, then fall back to the default success
    pub fn with_script(id: ProviderId, outcomes: Vec<Outcome>) -> Self {
        let mock = Self::new(id);
        *mock.script.lock().unwrap_or_else(|e| e.into_inner()) = outcomes.into();
        mock
    }

    /// Append one more scripted outcome
    pub fn push(&self, outcome: Outcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// Invocations so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn invoke(&self, _prompt: &str, _api_key: &str) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Fixed key material, no environment involved
#[derive(Debug, Clone)]
pub struct StaticKeySource {
    primary: Option<String>,
    secondary: Option<String>,
}

impl StaticKeySource {
    pub fn new(primary: Option<&str>, secondary: Option<&str>) -> Self {
        Self {
            primary: primary.map(str::to_string),
            secondary: secondary.map(str::to_string),
        }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn key_for(&self, provider: ProviderId) -> Option<String> {
        match provider {
            ProviderId::Primary => self.primary.clone(),
            ProviderId::Secondary => self.secondary.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_replays_then_defaults() {
        let mock = MockBackend::with_script(
            ProviderId::Primary,
            vec![Outcome::NetworkError("down".into())],
        );
        assert!(matches!(
            mock.invoke("p", "k").await,
            Outcome::NetworkError(_)
        ));
        assert!(matches!(mock.invoke("p", "k").await, Outcome::Success(_)));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn static_keys_resolve_per_provider() {
        let keys = StaticKeySource::new(Some("pk"), None);
        assert_eq!(
            keys.key_for(ProviderId::Primary).await,
            Some("pk".to_string())
        );
        assert_eq!(keys.key_for(ProviderId::Secondary).await, None);
    }
}
