//! Core admission scheduler implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ThrottleConfig;
use crate::error::{Result, TurnstileError};

use super::channel::{Channel, Waiter};
use super::policy::{Policy, DEFAULT_WINDOW};

/// Channel used by callers that do not name one.
pub const DEFAULT_CHANNEL: &str = "default";

/// How long the drain loop suspends when capacity is exhausted.
///
/// A fixed short re-poll, not exponential backoff: window and spacing
/// durations are already known and short, so bounded-latency polling is the
/// simpler trade.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The admission scheduler: a registry of independently throttled channels.
///
/// This struct is thread-safe and can be shared across tasks behind an
/// [`Arc`]. Channels are created lazily on first use with the scheduler's
/// default policy; activity on one channel never affects another.
pub struct Scheduler {
    /// Channels indexed by name
    channels: DashMap<String, Arc<Channel>>,
    /// Policy applied to lazily created channels
    default_policy: Policy,
}

/// A point-in-time snapshot of one channel's scheduling state.
///
/// Occupancy and grant timestamps are meaningful for window policies only;
/// spacing channels report zero occupancy and an empty ledger.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    /// Number of grants still active within the trailing window
    pub occupancy: usize,
    /// Maximum concurrent grants the policy allows
    pub budget: usize,
    /// Number of callers suspended in the wait queue
    pub queue_depth: usize,
    /// Timestamps of the active grants, oldest first
    pub grant_timestamps: Vec<Instant>,
}

impl Scheduler {
    /// Create a scheduler whose unseen channels use the default window
    /// policy.
    pub fn new() -> Self {
        Self::with_default_policy(Policy::default())
    }

    /// Create a scheduler with an explicit policy for unseen channels.
    pub fn with_default_policy(default_policy: Policy) -> Self {
        Self {
            channels: DashMap::new(),
            default_policy,
        }
    }

    /// Create a scheduler from a loaded configuration.
    ///
    /// Each configured channel is created up front with its rule's policy;
    /// the configuration's default rule (if any) applies to channels created
    /// lazily later.
    pub fn with_config(config: &ThrottleConfig) -> Self {
        let default_policy = config
            .default
            .as_ref()
            .map(|rule| rule.to_policy())
            .unwrap_or_default();

        let scheduler = Self::with_default_policy(default_policy);
        for (name, rule) in &config.channels {
            scheduler.configure(name, rule.to_policy());
        }
        scheduler
    }

    /// Wait until the named channel grants a slot.
    ///
    /// The caller is appended to the channel's FIFO wait queue and resumes
    /// once the drain loop admits it. Unknown channel names are created on
    /// demand with the default policy.
    ///
    /// Returns [`TurnstileError::Interrupted`] if the channel is reset while
    /// this caller is still queued.
    pub async fn acquire(&self, channel: &str) -> Result<()> {
        self.acquire_tagged(channel, "anonymous").await
    }

    /// [`acquire`](Self::acquire) with a diagnostic label carried into logs.
    pub async fn acquire_tagged(&self, channel: &str, tag: &str) -> Result<()> {
        let chan = self.get_or_create(channel);

        let rx = {
            let mut state = chan.state.lock();
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                tag: tag.to_string(),
                handle: tx,
            });
            trace!(
                channel = %chan.name,
                tag = %tag,
                queue_depth = state.queue.len(),
                "Caller enqueued"
            );

            // At most one drain loop per channel; a busy channel only gets
            // the new waiter appended.
            if !state.draining {
                state.draining = true;
                tokio::spawn(drain(chan.clone(), state.epoch));
            }
            rx
        };

        rx.await.map_err(|_| TurnstileError::Interrupted {
            channel: channel.to_string(),
        })
    }

    /// Acquire a slot on the named channel, then run `work`.
    ///
    /// The work's output, success or failure, passes through unchanged; the
    /// scheduler never inspects or retries it. A failing `work` does not
    /// refund the slot, which was consumed at admission.
    pub async fn execute<F, Fut>(&self, channel: &str, work: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.acquire_tagged(channel, "execute").await?;
        Ok(work().await)
    }

    /// Switch the named channel to a window policy sized for
    /// `requests_per_window` requests.
    ///
    /// The enforced budget is `max(2, floor(requests_per_window)) - 1`;
    /// non-finite or below-minimum input is clamped, never rejected. The
    /// channel keeps its current window duration if it already has a window
    /// policy, otherwise the default window applies.
    pub fn set_limit(&self, channel: &str, requests_per_window: f64) {
        let chan = self.get_or_create(channel);
        let mut state = chan.state.lock();

        let window = match state.policy {
            Policy::Window { window, .. } => window,
            Policy::Spacing { .. } => DEFAULT_WINDOW,
        };
        state.policy = Policy::window_from_limit(requests_per_window, window);

        debug!(
            channel = %chan.name,
            requested = requests_per_window,
            budget = state.policy.budget(),
            "Channel limit updated"
        );
    }

    /// Replace the named channel's policy, creating the channel if absent.
    pub fn configure(&self, channel: &str, policy: Policy) {
        let chan = self.get_or_create(channel);
        let mut state = chan.state.lock();
        debug!(channel = %chan.name, policy = ?policy, "Channel policy configured");
        state.policy = policy;
    }

    /// Snapshot the named channel's state, creating the channel if absent.
    pub fn get_stats(&self, channel: &str) -> ChannelStats {
        let chan = self.get_or_create(channel);
        let mut state = chan.state.lock();
        let occupancy = state.occupancy(Instant::now());

        ChannelStats {
            occupancy,
            budget: state.policy.budget(),
            queue_depth: state.queue.len(),
            grant_timestamps: state.ledger.iter().copied().collect(),
        }
    }

    /// Clear the named channel's ledger, queue, and drain state.
    ///
    /// The registry entry and policy survive. Callers still queued are
    /// rejected with [`TurnstileError::Interrupted`]. Unknown names are a
    /// no-op.
    pub fn reset(&self, channel: &str) {
        if let Some(chan) = self.channels.get(channel) {
            debug!(channel = %channel, "Resetting channel");
            chan.state.lock().clear();
        }
    }

    /// [`reset`](Self::reset) applied to every channel.
    pub fn reset_all(&self) {
        debug!("Resetting all channels");
        for entry in self.channels.iter() {
            entry.value().state.lock().clear();
        }
    }

    /// Number of channels in the registry.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Get or lazily create a channel.
    fn get_or_create(&self, channel: &str) -> Arc<Channel> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(
                    channel = %channel,
                    policy = ?self.default_policy,
                    "Creating new channel"
                );
                Arc::new(Channel::new(channel, self.default_policy.clone()))
            })
            .clone()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-channel drain loop: grants queued callers in strict FIFO order until
/// the queue empties, then exits.
///
/// Back-to-back capacity is drained without suspending; the loop only sleeps
/// when the policy refuses admission. If the channel is reset while the loop
/// is alive, the epoch no longer matches and the loop exits immediately,
/// leaving the reset state untouched.
async fn drain(chan: Arc<Channel>, epoch: u64) {
    loop {
        let granted = {
            let mut state = chan.state.lock();
            if state.epoch != epoch {
                return;
            }
            if state.queue.is_empty() {
                state.draining = false;
                return;
            }
            if state.try_admit(Instant::now()) {
                state.queue.pop_front()
            } else {
                None
            }
        };

        match granted {
            Some(waiter) => {
                trace!(channel = %chan.name, tag = %waiter.tag, "Slot granted");
                // A caller that lost interest still consumed its grant; the
                // capacity is not reclaimed.
                let _ = waiter.handle.send(());
            }
            None => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    #[tokio::test]
    async fn test_acquire_creates_channel_with_default_policy() {
        init_tracing();
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.channel_count(), 0);

        scheduler.acquire(DEFAULT_CHANNEL).await.unwrap();

        assert_eq!(scheduler.channel_count(), 1);
        let stats = scheduler.get_stats(DEFAULT_CHANNEL);
        assert_eq!(stats.budget, 9);
        assert_eq!(stats.occupancy, 1);
    }

    #[tokio::test]
    async fn test_set_limit_budget_arithmetic() {
        let scheduler = Scheduler::new();

        scheduler.set_limit("a", 1.0);
        assert_eq!(scheduler.get_stats("a").budget, 1);

        scheduler.set_limit("a", 20.0);
        assert_eq!(scheduler.get_stats("a").budget, 19);

        scheduler.set_limit("a", 0.0);
        assert_eq!(scheduler.get_stats("a").budget, 1);

        scheduler.set_limit("a", -5.0);
        assert_eq!(scheduler.get_stats("a").budget, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupancy_never_exceeds_budget() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.set_limit("api", 4.0); // budget 3

        for _ in 0..3 {
            scheduler.acquire("api").await.unwrap();
        }
        let stats = scheduler.get_stats("api");
        assert_eq!(stats.occupancy, 3);

        // A fourth caller must wait; occupancy stays at the budget.
        let pending = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.acquire("api").await }
        });
        tokio::task::yield_now().await;

        let stats = scheduler.get_stats("api");
        assert_eq!(stats.occupancy, 3);
        assert_eq!(stats.queue_depth, 1);

        // Once a ledger entry expires, the waiter is granted.
        pending.await.unwrap().unwrap();
        assert!(scheduler.get_stats("api").occupancy <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_follow_arrival_order() {
        init_tracing();
        let scheduler = Arc::new(Scheduler::new());
        scheduler.set_limit("ordered", 2.0); // budget 1

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let scheduler = scheduler.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .acquire_tagged("ordered", &format!("caller-{i}"))
                    .await
                    .unwrap();
                order.lock().push(i);
            }));
            // Let each caller reach the queue before spawning the next, so
            // arrival order is deterministic.
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_entry_frees_capacity_at_window_boundary() {
        let scheduler = Scheduler::new();
        scheduler.configure(
            "timed",
            Policy::Window {
                window: Duration::from_millis(1000),
                budget: 2,
            },
        );

        scheduler.acquire("timed").await.unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        scheduler.acquire("timed").await.unwrap();
        assert_eq!(scheduler.get_stats("timed").occupancy, 2);

        tokio::time::advance(Duration::from_millis(800)).await;
        assert_eq!(scheduler.get_stats("timed").occupancy, 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(scheduler.get_stats("timed").occupancy, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_rejects_pending_waiters() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.set_limit("busy", 2.0); // budget 1

        scheduler.acquire("busy").await.unwrap();

        let pending = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.acquire("busy").await }
        });
        tokio::task::yield_now().await;
        assert_eq!(scheduler.get_stats("busy").queue_depth, 1);

        scheduler.reset("busy");

        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(TurnstileError::Interrupted { ref channel }) if channel.as_str() == "busy"
        ));

        let stats = scheduler.get_stats("busy");
        assert_eq!(stats.occupancy, 0);
        assert_eq!(stats.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_all_clears_every_channel() {
        let scheduler = Scheduler::new();
        scheduler.set_limit("a", 3.0);
        scheduler.set_limit("b", 6.0);
        scheduler.acquire("a").await.unwrap();
        scheduler.acquire("b").await.unwrap();

        scheduler.reset_all();

        for name in ["a", "b"] {
            let stats = scheduler.get_stats(name);
            assert_eq!(stats.occupancy, 0);
            assert_eq!(stats.queue_depth, 0);
            assert!(stats.grant_timestamps.is_empty());
        }
        // Registry entries survive a reset.
        assert_eq!(scheduler.channel_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_propagates_failure_without_refund() {
        let scheduler = Scheduler::new();
        scheduler.set_limit("work", 2.0); // budget 1

        let result = scheduler
            .execute("work", || async { Err::<(), &str>("downstream blew up") })
            .await
            .unwrap();
        assert_eq!(result, Err("downstream blew up"));

        // The slot was consumed at admission; the failure neither refunds
        // nor double-charges it.
        assert_eq!(scheduler.get_stats("work").occupancy, 1);

        // A later acquire proceeds normally once the window frees up.
        scheduler.acquire("work").await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_passes_success_through() {
        let scheduler = Scheduler::new();
        let value = scheduler.execute("work", || async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_are_independent() {
        let scheduler = Scheduler::new();
        scheduler.set_limit("a", 3.0); // budget 2
        scheduler.set_limit("b", 6.0); // budget 5

        scheduler.acquire("a").await.unwrap();
        scheduler.acquire("a").await.unwrap();

        assert_eq!(scheduler.get_stats("a").occupancy, 2);
        assert_eq!(scheduler.get_stats("b").occupancy, 0);

        scheduler.acquire("b").await.unwrap();
        assert_eq!(scheduler.get_stats("a").occupancy, 2);
        assert_eq!(scheduler.get_stats("b").occupancy, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_channel_stats_are_empty() {
        let scheduler = Scheduler::new();
        scheduler.configure(
            "paced",
            Policy::Spacing {
                interval: Duration::from_millis(250),
            },
        );

        scheduler.acquire("paced").await.unwrap();

        let stats = scheduler.get_stats("paced");
        assert_eq!(stats.occupancy, 0);
        assert_eq!(stats.budget, 0);
        assert!(stats.grant_timestamps.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_channel_paces_grants() {
        let scheduler = Scheduler::new();
        scheduler.configure(
            "paced",
            Policy::Spacing {
                interval: Duration::from_millis(500),
            },
        );

        let start = Instant::now();
        scheduler.acquire("paced").await.unwrap();
        scheduler.acquire("paced").await.unwrap();

        // The second grant cannot land before the spacing interval elapses.
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
