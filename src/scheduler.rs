//! Per-key trailing-edge debouncing.
//!
//! Every key is either Idle (no entry) or Pending (one entry with a live
//! timer). `notify` on a Pending key cancels the old timer, replaces the
//! payload and restarts the full delay, so only the last payload before a
//! quiet period is ever delivered. When a timer fires its entry is removed
//! before the sink runs: a delivery that causes another event for the same
//! key starts a fresh cycle instead of colliding with the firing one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::sink::ActionSink;

/// Cancellable handle for one pending timer.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Completes once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

/// A delivery that returned an error. The key is already Idle when this is
/// published.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFailure {
    pub key: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

struct PendingEntry<P> {
    /// Distinguishes this entry's timer from the ones it replaced.
    id: u64,
    scheduled_at: Instant,
    payload: P,
    token: CancellationToken,
}

struct SchedulerState<P> {
    entries: HashMap<String, PendingEntry<P>>,
    next_id: u64,
}

struct Shared<P> {
    state: Mutex<SchedulerState<P>>,
    sink: Arc<dyn ActionSink<P>>,
    failures: Option<UnboundedSender<DeliveryFailure>>,
}

/// Coalesces `(key, payload)` notifications and fires one delivery per key
/// per quiet period.
///
/// Cloning is cheap and clones share the same state. Timers are tokio tasks,
/// so `notify` must be called from within a tokio runtime.
pub struct DebounceScheduler<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for DebounceScheduler<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> DebounceScheduler<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(sink: Arc<dyn ActionSink<P>>) -> Self {
        Self::build(sink, None)
    }

    /// Like [`DebounceScheduler::new`], additionally publishing every failed
    /// delivery on `failures`.
    pub fn with_failure_reporter(
        sink: Arc<dyn ActionSink<P>>,
        failures: UnboundedSender<DeliveryFailure>,
    ) -> Self {
        Self::build(sink, Some(failures))
    }

    fn build(
        sink: Arc<dyn ActionSink<P>>,
        failures: Option<UnboundedSender<DeliveryFailure>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    entries: HashMap::new(),
                    next_id: 0,
                }),
                sink,
                failures,
            }),
        }
    }

    /// Schedule `payload` for `key` after `delay`, replacing any pending
    /// entry for the same key. Never blocks on the timer.
    pub fn notify(&self, key: impl Into<String>, payload: P, delay: Duration) {
        let key = key.into();
        let token = CancellationToken::new();

        let id = {
            let mut state = self.shared.lock();
            state.next_id += 1;
            let id = state.next_id;
            let entry = PendingEntry {
                id,
                scheduled_at: Instant::now(),
                payload,
                token: token.clone(),
            };
            if let Some(previous) = state.entries.insert(key.clone(), entry) {
                previous.token.cancel();
                tracing::debug!(
                    "Restarted timer for {} (pending {:?})",
                    key,
                    previous.scheduled_at.elapsed()
                );
            } else {
                tracing::debug!("Scheduled {} in {:?}", key, delay);
            }
            id
        };

        tokio::spawn(run_timer(Arc::clone(&self.shared), key, id, token, delay));
    }

    /// Drop the pending entry for `key`. Returns whether one existed.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.shared.lock().entries.remove(key);
        match removed {
            Some(entry) => {
                entry.token.cancel();
                tracing::debug!("Cancelled pending entry for {}", key);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending entry. Returns how many were dropped; calling it
    /// again is harmless and the scheduler keeps accepting `notify`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry<P>> = {
            let mut state = self.shared.lock();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.token.cancel();
        }
        if !drained.is_empty() {
            tracing::info!("Cancelled {} pending entries", drained.len());
        }
        drained.len()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().entries.len()
    }
}

impl<P> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, SchedulerState<P>> {
        // Every critical section is a single map operation
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the entry for `key` if it still belongs to timer `id`.
    fn take_if_current(&self, key: &str, id: u64) -> Option<P> {
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(entry) if entry.id == id => state.entries.remove(key).map(|entry| entry.payload),
            _ => None,
        }
    }
}

async fn run_timer<P>(
    shared: Arc<Shared<P>>,
    key: String,
    id: u64,
    token: CancellationToken,
    delay: Duration,
) where
    P: Send + Sync + 'static,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    // A replacement or cancel may have raced the wake-up
    let Some(payload) = shared.take_if_current(&key, id) else {
        return;
    };

    tracing::debug!("Quiet period elapsed for {}, delivering", key);
    if let Err(error) = shared.sink.deliver(&key, &payload).await {
        tracing::error!("Delivery failed for {}: {:#}", key, error);
        if let Some(failures) = &shared.failures {
            let _ = failures.send(DeliveryFailure {
                key,
                error: format!("{error:#}"),
                at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::{mpsc, Semaphore};
    use tokio::time::sleep;

    use super::*;
    use crate::sink::testing::RecordingSink;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn setup() -> (Arc<RecordingSink<&'static str>>, DebounceScheduler<&'static str>) {
        let sink = RecordingSink::<&'static str>::new();
        let scheduler: DebounceScheduler<&'static str> = DebounceScheduler::new(sink.clone());
        (sink, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_delivers_last_payload_once() {
        let (sink, scheduler) = setup();
        let start = Instant::now();

        scheduler.notify("a.ts", "p1", ms(100));
        sleep(ms(50)).await;
        scheduler.notify("a.ts", "p2", ms(100));

        sleep(ms(99)).await;
        assert!(sink.deliveries().is_empty(), "nothing may fire before t=150");
        assert!(scheduler.is_pending("a.ts"));

        sleep(ms(2)).await;
        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].key, "a.ts");
        assert_eq!(deliveries[0].payload, "p2");
        let fired_after = deliveries[0].at - start;
        assert!(fired_after >= ms(150) && fired_after <= ms(151), "{fired_after:?}");

        sleep(ms(500)).await;
        assert_eq!(sink.deliveries().len(), 1);
        assert!(!scheduler.is_pending("a.ts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_payload() {
        let (sink, scheduler) = setup();
        let payloads = ["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7"];

        for payload in payloads {
            scheduler.notify("lib.rs", payload, ms(100));
            sleep(ms(60)).await;
        }
        sleep(ms(200)).await;

        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, "p7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_delivery() {
        let (sink, scheduler) = setup();

        scheduler.notify("b.ts", "x", ms(50));
        sleep(ms(20)).await;
        assert!(scheduler.cancel("b.ts"));
        assert!(!scheduler.cancel("b.ts"));

        sleep(ms(500)).await;
        assert!(sink.deliveries().is_empty());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unknown_key_is_noop() {
        let (sink, scheduler) = setup();

        scheduler.notify("kept.ts", "x", ms(50));
        assert!(!scheduler.cancel("never-seen.ts"));

        sleep(ms(100)).await;
        assert_eq!(sink.count_for("kept.ts"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let (sink, scheduler) = setup();
        let start = Instant::now();

        scheduler.notify("one.ts", "1a", ms(100));
        scheduler.notify("two.ts", "2a", ms(100));
        scheduler.notify("three.ts", "3a", ms(100));
        sleep(ms(50)).await;
        scheduler.notify("one.ts", "1b", ms(100));
        assert!(scheduler.cancel("three.ts"));

        sleep(ms(200)).await;

        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 2);
        let two = deliveries.iter().find(|d| d.key == "two.ts").unwrap();
        let one = deliveries.iter().find(|d| d.key == "one.ts").unwrap();
        assert_eq!(two.payload, "2a");
        assert!(two.at - start <= ms(101));
        assert_eq!(one.payload, "1b");
        assert!(one.at - start >= ms(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_is_idle_after_fire() {
        let (sink, scheduler) = setup();

        scheduler.notify("c.ts", "first", ms(100));
        sleep(ms(150)).await;
        assert_eq!(sink.count_for("c.ts"), 1);
        assert!(!scheduler.is_pending("c.ts"));

        let restart = Instant::now();
        scheduler.notify("c.ts", "second", ms(100));
        sleep(ms(99)).await;
        assert_eq!(sink.count_for("c.ts"), 1, "a fresh full delay applies");

        sleep(ms(2)).await;
        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[1].payload, "second");
        assert!(deliveries[1].at - restart >= ms(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_everything_and_stays_usable() {
        let (sink, scheduler) = setup();

        scheduler.notify("a.ts", "a", ms(100));
        scheduler.notify("b.ts", "b", ms(100));
        scheduler.notify("c.ts", "c", ms(100));
        sleep(ms(90)).await;

        assert_eq!(scheduler.cancel_all(), 3);
        assert_eq!(scheduler.cancel_all(), 0);
        sleep(ms(500)).await;
        assert!(sink.deliveries().is_empty());

        scheduler.notify("a.ts", "again", ms(100));
        sleep(ms(150)).await;
        let deliveries = sink.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, "again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_fires_promptly() {
        let (sink, scheduler) = setup();

        scheduler.notify("now.ts", "x", Duration::ZERO);
        sleep(ms(1)).await;
        assert_eq!(sink.count_for("now.ts"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_reported_and_isolated() {
        let sink = RecordingSink::<&'static str>::failing_for(&["bad.ts"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler: DebounceScheduler<&'static str> =
            DebounceScheduler::with_failure_reporter(sink.clone(), tx);

        scheduler.notify("bad.ts", "x", ms(100));
        scheduler.notify("good.ts", "y", ms(150));
        sleep(ms(120)).await;

        let failure = rx.try_recv().unwrap();
        assert_eq!(failure.key, "bad.ts");
        assert!(failure.error.contains("sink rejected"));
        assert!(!scheduler.is_pending("bad.ts"));
        assert!(scheduler.is_pending("good.ts"));

        sleep(ms(500)).await;
        assert_eq!(sink.count_for("bad.ts"), 1, "a failure never re-arms the timer");
        assert_eq!(sink.count_for("good.ts"), 1);
        assert!(rx.try_recv().is_err());

        scheduler.notify("bad.ts", "retry", ms(100));
        sleep(ms(150)).await;
        assert_eq!(sink.count_for("bad.ts"), 2);
    }

    /// Suspends every delivery until the test hands out a permit.
    struct GatedSink {
        gate: Semaphore,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl ActionSink<&'static str> for GatedSink {
        async fn deliver(&self, _key: &str, _payload: &&'static str) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_during_suspended_delivery_starts_fresh_cycle() {
        let sink = Arc::new(GatedSink {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        });
        let scheduler: DebounceScheduler<&'static str> = DebounceScheduler::new(sink.clone());

        scheduler.notify("k.ts", "first", ms(10));
        sleep(ms(20)).await;
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending("k.ts"), "entry is removed before delivery");

        scheduler.notify("k.ts", "second", ms(10));
        assert!(scheduler.is_pending("k.ts"));
        sleep(ms(20)).await;
        assert_eq!(sink.started.load(Ordering::SeqCst), 2);
        assert_eq!(sink.finished.load(Ordering::SeqCst), 0);

        sink.gate.add_permits(2);
        sleep(ms(1)).await;
        assert_eq!(sink.finished.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }
}
