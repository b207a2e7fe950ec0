//! Client-side throttling and deferred dispatch
//!
//! Two local limits per provider, enforced before any request leaves the
//! process: a sliding sixty-second request window and a concurrent
//! in-flight ceiling. Callers either wait inline ([`throttled_request`])
//! or park work on a priority queue ([`queue_request`]) that a drain task
//! feeds through the same limits.
//!
//! In-flight slots are held through a guard, so a caller that abandons a
//! paced request (timeout, `select!`) still returns its slot when the
//! future drops.
//!
//! All timing goes through `tokio::time`, so tests run against a paused
//! clock.
//!
//! [`throttled_request`]: ThrottleController::throttled_request
//! [`queue_request`]: ThrottleController::queue_request

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::api::{Priority, ProviderId, RouterError, RouterResult, ThrottleReason, ThrottleStatus};
use crate::config::RouterConfig;

/// Width of the sliding request window
const WINDOW: Duration = Duration::from_secs(60);

/// Poll interval while waiting for an in-flight slot
const CONCURRENCY_POLL: Duration = Duration::from_millis(500);

/// Pause between queued dispatches, so a drained queue cannot burst
const DISPATCH_GAP: Duration = Duration::from_millis(150);

/// Utilization above which dispatch slows down preemptively
const ADAPTIVE_DELAY_THRESHOLD: f64 = 0.7;

/// Ceiling on the preemptive slow-down
const ADAPTIVE_DELAY_MAX: Duration = Duration::from_millis(3000);

/// How often the background sweeper prunes idle windows
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct QueueEntry {
    job: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct ProviderThrottle {
    /// Start instants of requests inside the sliding window, oldest first
    recent: VecDeque<Instant>,
    /// Deferred work, front is next to dispatch
    queue: VecDeque<QueueEntry>,
    /// A drain task currently owns this queue
    draining: bool,
}

impl ProviderThrottle {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Window/queue state plus the in-flight slot counter for one provider
///
/// `active` lives outside the mutex so a plain `Drop` impl can release a
/// slot without locking.
#[derive(Default)]
struct ProviderState {
    throttle: Mutex<ProviderThrottle>,
    active: AtomicU32,
}

/// Owns one in-flight slot; dropping it releases the slot, whether the
/// paced request resolved or was cancelled mid-flight
struct InFlightGuard<'a> {
    active: &'a AtomicU32,
    provider: ProviderId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        release_slot(self.active, self.provider);
    }
}

fn release_slot(active: &AtomicU32, provider: ProviderId) {
    let released = active.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    if released.is_err() {
        warn!(provider = %provider, "Request end without matching start");
    }
}

struct Inner {
    config: RouterConfig,
    primary: ProviderState,
    secondary: ProviderState,
    shutdown: watch::Sender<bool>,
}

/// Per-provider request pacing
///
/// Cheap to clone; clones share the same window and queue state.
#[derive(Clone)]
pub struct ThrottleController {
    inner: Arc<Inner>,
}

impl ThrottleController {
    pub fn new(config: RouterConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                primary: ProviderState::default(),
                secondary: ProviderState::default(),
                shutdown,
            }),
        }
    }

    fn state(&self, provider: ProviderId) -> &ProviderState {
        match provider {
            ProviderId::Primary => &self.inner.primary,
            ProviderId::Secondary => &self.inner.secondary,
        }
    }

    /// Whether a request to `provider` would have to wait right now, and why
    ///
    /// Advisory read; admission itself goes through [`try_acquire`] so the
    /// answer cannot go stale between check and claim.
    ///
    /// [`try_acquire`]: Self::try_acquire
    pub async fn should_throttle(&self, provider: ProviderId) -> Option<ThrottleReason> {
        let profile = self.inner.config.profile(provider);
        let state = self.state(provider);
        let mut throttle = state.throttle.lock().await;
        throttle.prune(Instant::now());

        if throttle.recent.len() as u32 >= profile.requests_per_minute {
            return Some(ThrottleReason::RateLimit);
        }
        if state.active.load(Ordering::SeqCst) >= profile.max_concurrent {
            return Some(ThrottleReason::ConcurrentLimit);
        }
        None
    }

    /// Mark a request as dispatched: stamp the window, take a slot
    pub async fn record_request_start(&self, provider: ProviderId) {
        let state = self.state(provider);
        let mut throttle = state.throttle.lock().await;
        throttle.recent.push_back(Instant::now());
        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(provider = %provider, active, "Request started");
    }

    /// Release the in-flight slot taken at start
    pub async fn record_request_end(&self, provider: ProviderId) {
        release_slot(&self.state(provider).active, provider);
    }

    /// Claim a slot if both limits allow it right now
    ///
    /// The window check and stamp happen under one lock hold and the slot
    /// claim is a conditional atomic update, so concurrent callers cannot
    /// overshoot either ceiling.
    async fn try_acquire(
        &self,
        provider: ProviderId,
    ) -> Result<InFlightGuard<'_>, ThrottleReason> {
        let profile = self.inner.config.profile(provider);
        let state = self.state(provider);
        let mut throttle = state.throttle.lock().await;
        throttle.prune(Instant::now());

        if throttle.recent.len() as u32 >= profile.requests_per_minute {
            return Err(ThrottleReason::RateLimit);
        }
        let claimed = state.active.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            (v < profile.max_concurrent).then_some(v + 1)
        });
        if claimed.is_err() {
            return Err(ThrottleReason::ConcurrentLimit);
        }
        throttle.recent.push_back(Instant::now());
        trace!(provider = %provider, "Request started");
        Ok(InFlightGuard {
            active: &state.active,
            provider,
        })
    }

    /// Wait until both limits allow a request, then claim the slot
    async fn acquire(&self, provider: ProviderId) -> InFlightGuard<'_> {
        loop {
            self.adaptive_delay(provider).await;
            match self.try_acquire(provider).await {
                Ok(guard) => return guard,
                Err(ThrottleReason::RateLimit) => {
                    let wait = self.time_until_window_slot(provider).await;
                    debug!(provider = %provider, wait_ms = wait.as_millis() as u64,
                        "Rate window full, waiting");
                    sleep(wait).await;
                }
                Err(ThrottleReason::ConcurrentLimit) => {
                    debug!(provider = %provider, "Concurrency ceiling reached, waiting");
                    sleep(CONCURRENCY_POLL).await;
                }
            }
        }
    }

    /// Run `request` against `provider` once both limits allow it
    ///
    /// Waits as long as it takes; the request itself is never cancelled or
    /// retried here. The in-flight slot is released when `request` resolves
    /// or when this future is dropped, so abandoning a paced call cannot
    /// leak concurrency.
    pub async fn throttled_request<F, T>(&self, provider: ProviderId, request: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(provider).await;
        request.await
    }

    /// Time until the oldest window entry ages out
    async fn time_until_window_slot(&self, provider: ProviderId) -> Duration {
        let throttle = self.state(provider).throttle.lock().await;
        match throttle.recent.front() {
            Some(&oldest) => {
                let elapsed = Instant::now().duration_since(oldest);
                WINDOW.saturating_sub(elapsed).max(Duration::from_millis(50))
            }
            None => Duration::from_millis(50),
        }
    }

    /// Slow down proportionally once the window runs hot
    async fn adaptive_delay(&self, provider: ProviderId) {
        let status = self.throttle_status(provider).await;
        if status.utilization <= ADAPTIVE_DELAY_THRESHOLD {
            return;
        }
        let over = (status.utilization - ADAPTIVE_DELAY_THRESHOLD)
            / (1.0 - ADAPTIVE_DELAY_THRESHOLD);
        let delay = ADAPTIVE_DELAY_MAX.mul_f64(over.min(1.0));
        debug!(provider = %provider, delay_ms = delay.as_millis() as u64,
            utilization = status.utilization, "Adaptive delay");
        sleep(delay).await;
    }

    /// Park `request` on the provider's queue and wait for its result
    ///
    /// [`Priority::High`] entries go to the front. Dispatch order within a
    /// priority is FIFO, with [`DISPATCH_GAP`] between consecutive jobs.
    pub async fn queue_request<F, T>(
        &self,
        provider: ProviderId,
        priority: Priority,
        request: F,
    ) -> RouterResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let rx = self.enqueue(provider, priority, request).await;
        rx.await.map_err(|_| RouterError::QueueClosed)
    }

    /// Enqueue without waiting; the receiver resolves when the job has run
    pub async fn enqueue<F, T>(
        &self,
        provider: ProviderId,
        priority: Priority,
        request: F,
    ) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: BoxFuture<'static, ()> = Box::pin(async move {
            let result = request.await;
            let _ = tx.send(result);
        });

        let spawn_drain = {
            let mut throttle = self.state(provider).throttle.lock().await;
            match priority {
                Priority::High => throttle.queue.push_front(QueueEntry { job }),
                Priority::Normal => throttle.queue.push_back(QueueEntry { job }),
            }
            debug!(provider = %provider, depth = throttle.queue.len(), ?priority, "Request queued");
            if throttle.draining {
                false
            } else {
                throttle.draining = true;
                true
            }
        };

        if spawn_drain {
            let controller = self.clone();
            tokio::spawn(controller.drain(provider));
        }
        rx
    }

    /// Feed queued jobs through the throttle until the queue empties
    async fn drain(self, provider: ProviderId) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            {
                let mut throttle = self.state(provider).throttle.lock().await;
                if *self.inner.shutdown.borrow() {
                    // Dropping the entries drops their oneshot senders;
                    // waiters observe QueueClosed.
                    throttle.queue.clear();
                    throttle.draining = false;
                    return;
                }
                if throttle.queue.is_empty() {
                    // Checked under the lock, so a concurrent enqueue either
                    // sees draining=false or lands before this check.
                    throttle.draining = false;
                    return;
                }
            }

            tokio::select! {
                guard = self.acquire(provider) => {
                    let entry = self.state(provider).throttle.lock().await.queue.pop_front();
                    if let Some(entry) = entry {
                        entry.job.await;
                    }
                    drop(guard);
                    sleep(DISPATCH_GAP).await;
                }
                _ = async {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => continue,
            }
        }
    }

    /// Point-in-time window and concurrency figures for one provider
    pub async fn throttle_status(&self, provider: ProviderId) -> ThrottleStatus {
        let profile = self.inner.config.profile(provider);
        let state = self.state(provider);
        let mut throttle = state.throttle.lock().await;
        throttle.prune(Instant::now());

        let recent = throttle.recent.len() as u32;
        ThrottleStatus {
            provider,
            recent_requests: recent,
            requests_per_minute: profile.requests_per_minute,
            utilization: if profile.requests_per_minute == 0 {
                1.0
            } else {
                recent as f64 / profile.requests_per_minute as f64
            },
            active: state.active.load(Ordering::SeqCst),
            max_concurrent: profile.max_concurrent,
        }
    }

    /// Periodically prune idle windows so quiet providers do not hold
    /// stale timestamps between requests
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let controller = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = Instant::now();
                        for provider in ProviderId::all() {
                            controller.state(provider).throttle.lock().await.prune(now);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks; in-flight requests finish normally
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn controller() -> ThrottleController {
        ThrottleController::new(RouterConfig::default())
    }

    // Default profile limits: primary 10 rpm / 2 concurrent,
    // secondary 60 rpm / 4 concurrent.

    #[tokio::test(start_paused = true)]
    async fn no_throttle_when_idle() {
        let throttle = controller();
        assert_eq!(throttle.should_throttle(ProviderId::Primary).await, None);
        assert_eq!(throttle.should_throttle(ProviderId::Secondary).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_window_fills_and_slides() {
        let throttle = controller();
        for _ in 0..10 {
            throttle.record_request_start(ProviderId::Primary).await;
            throttle.record_request_end(ProviderId::Primary).await;
        }
        assert_eq!(
            throttle.should_throttle(ProviderId::Primary).await,
            Some(ThrottleReason::RateLimit)
        );

        // The other provider's window is independent.
        assert_eq!(throttle.should_throttle(ProviderId::Secondary).await, None);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(throttle.should_throttle(ProviderId::Primary).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_ceiling() {
        let throttle = controller();
        throttle.record_request_start(ProviderId::Primary).await;
        throttle.record_request_start(ProviderId::Primary).await;
        assert_eq!(
            throttle.should_throttle(ProviderId::Primary).await,
            Some(ThrottleReason::ConcurrentLimit)
        );

        throttle.record_request_end(ProviderId::Primary).await;
        assert_eq!(throttle.should_throttle(ProviderId::Primary).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn end_without_start_does_not_underflow() {
        let throttle = controller();
        throttle.record_request_end(ProviderId::Primary).await;
        let status = throttle.throttle_status(ProviderId::Primary).await;
        assert_eq!(status.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_claim_is_atomic_with_the_check() {
        let throttle = controller();
        let first = throttle.try_acquire(ProviderId::Primary).await;
        let second = throttle.try_acquire(ProviderId::Primary).await;
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(matches!(
            throttle.try_acquire(ProviderId::Primary).await,
            Err(ThrottleReason::ConcurrentLimit)
        ));

        // Returning a slot reopens admission.
        drop(first);
        let third = throttle.try_acquire(ProviderId::Primary).await;
        assert!(third.is_ok());

        drop(second);
        drop(third);
        assert_eq!(throttle.throttle_status(ProviderId::Primary).await.active, 0);

        // Each successful claim stamped the window.
        assert_eq!(
            throttle.throttle_status(ProviderId::Primary).await.recent_requests,
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_rejects_claims_under_one_lock() {
        let throttle = controller();
        for _ in 0..10 {
            let guard = throttle.try_acquire(ProviderId::Primary).await;
            drop(guard);
        }
        assert!(matches!(
            throttle.try_acquire(ProviderId::Primary).await,
            Err(ThrottleReason::RateLimit)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_request_runs_inline_under_capacity() {
        let throttle = controller();
        let out = throttle
            .throttled_request(ProviderId::Primary, async { 7 })
            .await;
        assert_eq!(out, 7);

        let status = throttle.throttle_status(ProviderId::Primary).await;
        assert_eq!(status.recent_requests, 1);
        assert_eq!(status.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_request_releases_its_slot() {
        let throttle = controller();
        let paced = throttle.throttled_request(ProviderId::Primary, async {
            sleep(Duration::from_secs(3600)).await;
            "never"
        });
        // The caller gives up long before the work resolves.
        let result = tokio::time::timeout(Duration::from_secs(1), paced).await;
        assert!(result.is_err());

        let status = throttle.throttle_status(ProviderId::Primary).await;
        assert_eq!(status.active, 0);
        // The window stamp stays; only the slot is returned.
        assert_eq!(status.recent_requests, 1);

        // And the slot is genuinely reusable at full concurrency.
        throttle.record_request_start(ProviderId::Primary).await;
        throttle.record_request_start(ProviderId::Primary).await;
        assert_eq!(
            throttle.should_throttle(ProviderId::Primary).await,
            Some(ThrottleReason::ConcurrentLimit)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_request_waits_out_a_full_window() {
        let throttle = controller();
        for _ in 0..10 {
            throttle.record_request_start(ProviderId::Primary).await;
            throttle.record_request_end(ProviderId::Primary).await;
        }

        let before = Instant::now();
        let out = throttle
            .throttled_request(ProviderId::Primary, async { "done" })
            .await;
        assert_eq!(out, "done");
        // Paused clock: the wait shows up as advanced time, roughly one
        // window width.
        assert!(Instant::now().duration_since(before) >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_delay_is_zero_at_the_threshold() {
        let throttle = controller();
        // 7 of 10: exactly the 70% threshold, which must not delay.
        for _ in 0..7 {
            throttle.record_request_start(ProviderId::Primary).await;
            throttle.record_request_end(ProviderId::Primary).await;
        }

        let before = Instant::now();
        throttle.adaptive_delay(ProviderId::Primary).await;
        assert_eq!(Instant::now().duration_since(before), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_delay_scales_with_window_density() {
        let throttle = controller();
        // 9 of 10: two thirds of the way from threshold to ceiling.
        for _ in 0..9 {
            throttle.record_request_start(ProviderId::Primary).await;
            throttle.record_request_end(ProviderId::Primary).await;
        }

        let before = Instant::now();
        throttle.adaptive_delay(ProviderId::Primary).await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(1990), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(2010), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_delay_is_capped_at_saturation() {
        let throttle = controller();
        for _ in 0..10 {
            throttle.record_request_start(ProviderId::Primary).await;
            throttle.record_request_end(ProviderId::Primary).await;
        }

        let before = Instant::now();
        throttle.adaptive_delay(ProviderId::Primary).await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= ADAPTIVE_DELAY_MAX, "waited {:?}", waited);
        assert!(
            waited <= ADAPTIVE_DELAY_MAX + Duration::from_millis(10),
            "waited {:?}",
            waited
        );
    }

    #[tokio::test(start_paused = true)]
    async fn queue_runs_jobs_and_returns_results() {
        let throttle = controller();
        let out = throttle
            .queue_request(ProviderId::Secondary, Priority::Normal, async { 41 + 1 })
            .await
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_jumps_the_queue() {
        let throttle = controller();
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        // Saturate concurrency so the drain task blocks before dispatching.
        throttle.record_request_start(ProviderId::Primary).await;
        throttle.record_request_start(ProviderId::Primary).await;

        let tag = |name: &'static str| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(name);
            }
        };
        let rx_a = throttle
            .enqueue(ProviderId::Primary, Priority::Normal, tag("a"))
            .await;
        let rx_b = throttle
            .enqueue(ProviderId::Primary, Priority::Normal, tag("b"))
            .await;
        let rx_c = throttle
            .enqueue(ProviderId::Primary, Priority::High, tag("c"))
            .await;

        // Let the drain task reach its capacity wait, then open a slot.
        tokio::time::sleep(Duration::from_millis(100)).await;
        throttle.record_request_end(ProviderId::Primary).await;
        throttle.record_request_end(ProviderId::Primary).await;

        rx_a.await.unwrap();
        rx_b.await.unwrap();
        rx_c.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_jobs_respect_the_rate_window() {
        let throttle = controller();
        for _ in 0..10 {
            throttle.record_request_start(ProviderId::Primary).await;
            throttle.record_request_end(ProviderId::Primary).await;
        }

        let before = Instant::now();
        throttle
            .queue_request(ProviderId::Primary, Priority::Normal, async {})
            .await
            .unwrap();
        assert!(Instant::now().duration_since(before) >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_window_and_utilization() {
        let throttle = controller();
        for _ in 0..5 {
            throttle.record_request_start(ProviderId::Primary).await;
            throttle.record_request_end(ProviderId::Primary).await;
        }

        let status = throttle.throttle_status(ProviderId::Primary).await;
        assert_eq!(status.recent_requests, 5);
        assert_eq!(status.requests_per_minute, 10);
        assert!((status.utilization - 0.5).abs() < f64::EPSILON);
        assert_eq!(status.active, 0);
        assert_eq!(status.max_concurrent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_pending_queue_entries() {
        let throttle = controller();
        // Saturate concurrency so the queued job can never dispatch.
        throttle.record_request_start(ProviderId::Primary).await;
        throttle.record_request_start(ProviderId::Primary).await;

        let pending = {
            let throttle = throttle.clone();
            tokio::spawn(async move {
                throttle
                    .queue_request(ProviderId::Primary, Priority::Normal, async { 1 })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        throttle.shutdown();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RouterError::QueueClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_shutdown() {
        let throttle = controller();
        let handle = throttle.spawn_sweeper();
        throttle.shutdown();
        handle.await.unwrap();
    }
}
