//! Day-scoped quota tracking and provider recommendation
//!
//! One [`QuotaRecord`] per provider per calendar day, persisted together as
//! a single JSON blob. Day rollover is lazy: every read/write path first
//! compares the stored date against today and resets both records when it
//! differs, so no background timer is needed.
//!
//! Tracking is advisory. Storage failures are logged and swallowed; a lost
//! counter costs at worst one mis-routed request, never a failed one.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::{ProviderId, QuotaStatus};
use crate::config::RouterConfig;
use crate::spi::QuotaStore;

/// Well-known storage key for the persisted snapshot
pub const QUOTA_STORE_KEY: &str = "llm_router.quota.v1";

/// Fraction of the daily cap at which a provider is treated as exhausted
/// before the provider itself rejects anything. Conservative policy choice,
/// tunable.
pub const PREDICTIVE_EXHAUST_FRACTION: f64 = 0.9;

/// Fraction of the daily cap past which traffic steers to the uncapped
/// provider. Tunable.
pub const PREFER_UNCAPPED_FRACTION: f64 = 0.8;

/// How long an exhaustion flag without an explicit retry-after is honored.
/// Matches the assumption that daily caps reset within a day. Tunable.
pub const FLAG_ASSUMED_RESET_HOURS: i64 = 24;

/// One provider's quota state for one calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Local calendar date this record applies to (YYYY-MM-DD)
    pub date: String,
    /// Requests attempted on `date`
    pub count: u32,
    pub quota_exceeded: bool,
    /// Do not retry before this instant, when the provider supplied one
    pub retry_after: Option<DateTime<Utc>>,
    /// When the exhaustion flag was set; backs the assumed-reset rule
    pub exceeded_at: Option<DateTime<Utc>>,
}

impl QuotaRecord {
    fn fresh(date: &str) -> Self {
        Self {
            date: date.to_string(),
            count: 0,
            quota_exceeded: false,
            retry_after: None,
            exceeded_at: None,
        }
    }
}

/// Both providers' records, persisted as one blob
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuotaSnapshot {
    primary: QuotaRecord,
    secondary: QuotaRecord,
}

impl QuotaSnapshot {
    fn fresh(date: &str) -> Self {
        Self {
            primary: QuotaRecord::fresh(date),
            secondary: QuotaRecord::fresh(date),
        }
    }

    fn record(&self, provider: ProviderId) -> &QuotaRecord {
        match provider {
            ProviderId::Primary => &self.primary,
            ProviderId::Secondary => &self.secondary,
        }
    }

    fn record_mut(&mut self, provider: ProviderId) -> &mut QuotaRecord {
        match provider {
            ProviderId::Primary => &mut self.primary,
            ProviderId::Secondary => &mut self.secondary,
        }
    }

    /// Reset both records when the stored date is not `today`
    fn roll_over_if_stale(&mut self, today: &str) {
        if self.primary.date != today || self.secondary.date != today {
            debug!(
                stored = %self.primary.date,
                today = %today,
                "Quota day rollover, resetting records"
            );
            *self = Self::fresh(today);
        }
    }
}

/// Tracks per-provider, per-day consumption and recommends where to route
///
/// Explicitly constructed and injected; holds no global state. All mutation
/// happens behind one `RwLock`, keeping read-modify-write sequences atomic
/// across await points.
#[derive(Debug)]
pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
    config: RouterConfig,
    state: RwLock<Option<QuotaSnapshot>>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>, config: RouterConfig) -> Self {
        Self {
            store,
            config,
            state: RwLock::new(None),
        }
    }

    fn today() -> String {
        Local::now().format("%Y-%m-%d").to_string()
    }

    fn daily_cap(&self, provider: ProviderId) -> Option<u32> {
        self.config.profile(provider).daily_cap
    }

    async fn load_from_store(&self) -> QuotaSnapshot {
        let today = Self::today();
        match self.store.load(QUOTA_STORE_KEY).await {
            Ok(Some(blob)) => serde_json::from_str(&blob).unwrap_or_else(|e| {
                warn!(error = %e, "Stored quota blob unreadable, starting fresh");
                QuotaSnapshot::fresh(&today)
            }),
            Ok(None) => QuotaSnapshot::fresh(&today),
            Err(e) => {
                warn!(error = %e, "Quota store read failed, starting fresh");
                QuotaSnapshot::fresh(&today)
            }
        }
    }

    async fn persist(&self, snapshot: &QuotaSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(blob) => {
                if let Err(e) = self.store.save(QUOTA_STORE_KEY, &blob).await {
                    warn!(error = %e, "Quota store write failed, keeping in-memory state");
                }
            }
            Err(e) => warn!(error = %e, "Quota snapshot serialization failed"),
        }
    }

    /// Run `mutate` against the current-day snapshot, then persist
    async fn with_snapshot<T>(&self, mutate: impl FnOnce(&mut QuotaSnapshot) -> T) -> T {
        let today = Self::today();
        let mut guard = self.state.write().await;
        if guard.is_none() {
            *guard = Some(self.load_from_store().await);
        }
        let snapshot = match guard.as_mut() {
            Some(s) => s,
            None => unreachable!("snapshot populated above"),
        };
        snapshot.roll_over_if_stale(&today);
        let result = mutate(snapshot);
        let to_persist = snapshot.clone();
        drop(guard);
        self.persist(&to_persist).await;
        result
    }

    /// Note that a request is about to be attempted against `provider`
    ///
    /// Never fails; the count is advisory.
    pub async fn record_request_attempt(&self, provider: ProviderId) {
        self.with_snapshot(|snap| {
            let record = snap.record_mut(provider);
            record.count = record.count.saturating_add(1);
            debug!(provider = %provider, count = record.count, "Recorded request attempt");
        })
        .await;
    }

    /// Flag `provider` as exhausted
    ///
    /// With `retry_after_secs`, retries are suppressed until that moment;
    /// without it, the assumed-reset window applies. The dispatcher supplies
    /// provider-appropriate defaults when the server gave none.
    pub async fn record_quota_exceeded(&self, provider: ProviderId, retry_after_secs: Option<u64>) {
        self.with_snapshot(|snap| {
            let now = Utc::now();
            let record = snap.record_mut(provider);
            record.quota_exceeded = true;
            record.exceeded_at = Some(now);
            record.retry_after = retry_after_secs.map(|s| now + Duration::seconds(s as i64));
            warn!(
                provider = %provider,
                retry_after_secs = ?retry_after_secs,
                "Provider flagged quota-exceeded"
            );
        })
        .await;
    }

    /// Manual override: clear the exhaustion flag unconditionally
    pub async fn clear_quota_exceeded(&self, provider: ProviderId) {
        self.with_snapshot(|snap| {
            let record = snap.record_mut(provider);
            record.quota_exceeded = false;
            record.retry_after = None;
            record.exceeded_at = None;
            debug!(provider = %provider, "Quota flag cleared manually");
        })
        .await;
    }

    /// Exhaustion flag set and not yet past its retry window
    fn flag_blocks(record: &QuotaRecord, now: DateTime<Utc>) -> bool {
        if !record.quota_exceeded {
            return false;
        }
        match record.retry_after {
            Some(at) => at > now,
            // No explicit reset time: honor the flag for the assumed window.
            None => record
                .exceeded_at
                .map(|at| now - at < Duration::hours(FLAG_ASSUMED_RESET_HOURS))
                .unwrap_or(true),
        }
    }

    fn predictive_exhausted(&self, provider: ProviderId, record: &QuotaRecord) -> bool {
        match self.daily_cap(provider) {
            Some(cap) if cap > 0 => {
                (record.count as f64) >= (cap as f64) * PREDICTIVE_EXHAUST_FRACTION
            }
            _ => false,
        }
    }

    /// Whether routing to `provider` is likely to be rejected
    ///
    /// True when the exhaustion flag is still in force, or predictively once
    /// today's count crosses [`PREDICTIVE_EXHAUST_FRACTION`] of a daily cap.
    pub async fn is_likely_over_quota(&self, provider: ProviderId) -> bool {
        self.with_snapshot(|snap| {
            let record = snap.record(provider);
            Self::flag_blocks(record, Utc::now()) || self.predictive_exhausted(provider, record)
        })
        .await
    }

    /// Point-in-time status for one provider
    pub async fn quota_status(&self, provider: ProviderId) -> QuotaStatus {
        self.with_snapshot(|snap| {
            let record = snap.record(provider);
            let limit = self.config.profile(provider).daily_cap;
            let now = Utc::now();
            QuotaStatus {
                provider,
                count: record.count,
                limit,
                quota_exceeded: record.quota_exceeded,
                retry_after: record.retry_after,
                can_retry: record.retry_after.map_or(true, |at| at <= now),
                percentage: limit
                    .filter(|&cap| cap > 0)
                    .map(|cap| (record.count as f64 / cap as f64) * 100.0),
            }
        })
        .await
    }

    /// Status for both providers in fixed order
    pub async fn all_quota_status(&self) -> Vec<QuotaStatus> {
        let mut out = Vec::with_capacity(2);
        for provider in ProviderId::all() {
            out.push(self.quota_status(provider).await);
        }
        out
    }

    /// Pick the provider a new request should go to, or `None` when no
    /// configured provider is usable
    ///
    /// Decision order: configured keys first, then exhaustion flags, then
    /// cost — the daily-capped (free) provider is the default until its
    /// usage crosses [`PREFER_UNCAPPED_FRACTION`], after which the uncapped
    /// one takes over.
    pub async fn recommended_provider(
        &self,
        has_primary_key: bool,
        has_secondary_key: bool,
    ) -> Option<ProviderId> {
        self.with_snapshot(|snap| {
            let now = Utc::now();
            let blocked =
                |p: ProviderId| -> bool { Self::flag_blocks(snap.record(p), now) };

            match (has_primary_key, has_secondary_key) {
                (false, false) => None,
                (true, false) => (!blocked(ProviderId::Primary)).then_some(ProviderId::Primary),
                (false, true) => {
                    (!blocked(ProviderId::Secondary)).then_some(ProviderId::Secondary)
                }
                (true, true) => {
                    let primary_blocked = blocked(ProviderId::Primary);
                    let secondary_blocked = blocked(ProviderId::Secondary);
                    if primary_blocked && secondary_blocked {
                        return None;
                    }
                    if primary_blocked {
                        return Some(ProviderId::Secondary);
                    }
                    if secondary_blocked {
                        return Some(ProviderId::Primary);
                    }

                    // Both usable: steer off a nearly-spent daily cap,
                    // otherwise stay on the no-add-on-cost provider.
                    let capped = ProviderId::all()
                        .into_iter()
                        .find(|&p| self.config.profile(p).daily_cap.is_some());
                    match capped {
                        Some(capped_provider) => {
                            let record = snap.record(capped_provider);
                            let cap = self
                                .config
                                .profile(capped_provider)
                                .daily_cap
                                .unwrap_or(0)
                                .max(1);
                            let used = record.count as f64 / cap as f64;
                            if used > PREFER_UNCAPPED_FRACTION {
                                Some(capped_provider.other())
                            } else {
                                Some(capped_provider)
                            }
                        }
                        None => Some(ProviderId::Primary),
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::MemoryQuotaStore;

    fn tracker_with_store(store: Arc<MemoryQuotaStore>) -> QuotaTracker {
        QuotaTracker::new(store, RouterConfig::default())
    }

    fn tracker() -> QuotaTracker {
        tracker_with_store(Arc::new(MemoryQuotaStore::new()))
    }

    #[tokio::test]
    async fn monotonic_counting() {
        let tracker = tracker();
        for _ in 0..5 {
            tracker.record_request_attempt(ProviderId::Primary).await;
        }
        let status = tracker.quota_status(ProviderId::Primary).await;
        assert_eq!(status.count, 5);
        assert_eq!(status.limit, Some(50));
        assert_eq!(status.percentage, Some(10.0));

        // The other provider is untouched.
        assert_eq!(tracker.quota_status(ProviderId::Secondary).await.count, 0);
    }

    #[tokio::test]
    async fn day_rollover_resets_stale_records() {
        let store = Arc::new(MemoryQuotaStore::new());
        let stale = QuotaSnapshot {
            primary: QuotaRecord {
                date: "2000-01-01".to_string(),
                count: 42,
                quota_exceeded: true,
                retry_after: None,
                exceeded_at: Some(Utc::now()),
            },
            secondary: QuotaRecord::fresh("2000-01-01"),
        };
        store
            .seed(QUOTA_STORE_KEY, &serde_json::to_string(&stale).unwrap())
            .await;

        let tracker = tracker_with_store(store);
        let status = tracker.quota_status(ProviderId::Primary).await;
        assert_eq!(status.count, 0);
        assert!(!status.quota_exceeded);
        assert_eq!(status.retry_after, None);
    }

    #[tokio::test]
    async fn quota_exceeded_with_retry_after_blocks() {
        let tracker = tracker();
        tracker
            .record_quota_exceeded(ProviderId::Primary, Some(3600))
            .await;
        assert!(tracker.is_likely_over_quota(ProviderId::Primary).await);

        let status = tracker.quota_status(ProviderId::Primary).await;
        assert!(status.quota_exceeded);
        assert!(!status.can_retry);
    }

    #[tokio::test]
    async fn quota_exceeded_past_retry_after_is_retryable() {
        let tracker = tracker();
        tracker
            .record_quota_exceeded(ProviderId::Secondary, Some(0))
            .await;
        let status = tracker.quota_status(ProviderId::Secondary).await;
        assert!(status.quota_exceeded);
        assert!(status.can_retry);
        assert!(!tracker.is_likely_over_quota(ProviderId::Secondary).await);
    }

    #[tokio::test]
    async fn quota_exceeded_without_retry_after_uses_assumed_window() {
        let tracker = tracker();
        tracker.record_quota_exceeded(ProviderId::Primary, None).await;
        // Flag was set moments ago, well inside the assumed-reset window.
        assert!(tracker.is_likely_over_quota(ProviderId::Primary).await);
    }

    #[tokio::test]
    async fn predictive_exhaustion_at_ninety_percent() {
        let tracker = tracker();
        for _ in 0..45 {
            tracker.record_request_attempt(ProviderId::Primary).await;
        }
        // 45/50 = 90% of the default cap.
        assert!(tracker.is_likely_over_quota(ProviderId::Primary).await);
        // But the flag itself is not set; the provider never rejected us.
        assert!(!tracker.quota_status(ProviderId::Primary).await.quota_exceeded);
    }

    #[tokio::test]
    async fn uncapped_provider_never_predictively_exhausts() {
        let tracker = tracker();
        for _ in 0..500 {
            tracker.record_request_attempt(ProviderId::Secondary).await;
        }
        assert!(!tracker.is_likely_over_quota(ProviderId::Secondary).await);
    }

    #[tokio::test]
    async fn clear_quota_exceeded_is_unconditional() {
        let tracker = tracker();
        tracker
            .record_quota_exceeded(ProviderId::Primary, Some(86_400))
            .await;
        assert!(tracker.is_likely_over_quota(ProviderId::Primary).await);

        tracker.clear_quota_exceeded(ProviderId::Primary).await;
        assert!(!tracker.is_likely_over_quota(ProviderId::Primary).await);
        let status = tracker.quota_status(ProviderId::Primary).await;
        assert!(!status.quota_exceeded);
        assert_eq!(status.retry_after, None);
    }

    #[tokio::test]
    async fn recommendation_no_keys() {
        assert_eq!(tracker().recommended_provider(false, false).await, None);
    }

    #[tokio::test]
    async fn recommendation_single_key() {
        let tracker = tracker();
        assert_eq!(
            tracker.recommended_provider(true, false).await,
            Some(ProviderId::Primary)
        );
        assert_eq!(
            tracker.recommended_provider(false, true).await,
            Some(ProviderId::Secondary)
        );
    }

    #[tokio::test]
    async fn recommendation_single_exhausted_key_is_none() {
        let tracker = tracker();
        tracker
            .record_quota_exceeded(ProviderId::Primary, Some(3600))
            .await;
        assert_eq!(tracker.recommended_provider(true, false).await, None);
    }

    #[tokio::test]
    async fn recommendation_prefers_other_when_one_exhausted() {
        let tracker = tracker();
        tracker
            .record_quota_exceeded(ProviderId::Primary, Some(3600))
            .await;
        assert_eq!(
            tracker.recommended_provider(true, true).await,
            Some(ProviderId::Secondary)
        );
    }

    #[tokio::test]
    async fn recommendation_defaults_to_free_provider() {
        let tracker = tracker();
        assert_eq!(
            tracker.recommended_provider(true, true).await,
            Some(ProviderId::Primary)
        );
    }

    #[tokio::test]
    async fn recommendation_steers_off_nearly_spent_cap() {
        let tracker = tracker();
        // 46/50 = 92% of the capped provider's quota.
        for _ in 0..46 {
            tracker.record_request_attempt(ProviderId::Primary).await;
        }
        assert_eq!(
            tracker.recommended_provider(true, true).await,
            Some(ProviderId::Secondary)
        );
    }

    #[tokio::test]
    async fn recommendation_none_when_both_exhausted() {
        let tracker = tracker();
        tracker
            .record_quota_exceeded(ProviderId::Primary, Some(3600))
            .await;
        tracker
            .record_quota_exceeded(ProviderId::Secondary, Some(3600))
            .await;
        assert_eq!(tracker.recommended_provider(true, true).await, None);
    }

    #[tokio::test]
    async fn storage_failures_are_swallowed() {
        #[derive(Debug)]
        struct FailingStore;

        #[async_trait::async_trait]
        impl QuotaStore for FailingStore {
            async fn load(&self, _key: &str) -> crate::api::RouterResult<Option<String>> {
                Err(std::io::Error::other("disk gone").into())
            }
            async fn save(&self, _key: &str, _value: &str) -> crate::api::RouterResult<()> {
                Err(std::io::Error::other("disk gone").into())
            }
        }

        let tracker = QuotaTracker::new(Arc::new(FailingStore), RouterConfig::default());
        // None of these may error or panic; in-memory state still advances.
        tracker.record_request_attempt(ProviderId::Primary).await;
        tracker.record_request_attempt(ProviderId::Primary).await;
        assert_eq!(tracker.quota_status(ProviderId::Primary).await.count, 2);
    }

    #[tokio::test]
    async fn state_persists_across_tracker_instances() {
        let store = Arc::new(MemoryQuotaStore::new());
        {
            let tracker = tracker_with_store(Arc::clone(&store));
            tracker.record_request_attempt(ProviderId::Primary).await;
            tracker.record_request_attempt(ProviderId::Primary).await;
        }
        let tracker = tracker_with_store(store);
        assert_eq!(tracker.quota_status(ProviderId::Primary).await.count, 2);
    }
}
