//! Per-channel scheduling state.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use super::policy::Policy;

/// A caller suspended in a channel's wait queue.
pub(crate) struct Waiter {
    /// Diagnostic label carried by the caller, used only in logs
    pub tag: String,
    /// Completion handle signaled when the caller is granted a slot
    pub handle: oneshot::Sender<()>,
}

/// An independently throttled request source.
///
/// Created lazily on first use and kept for process lifetime. All mutable
/// state lives behind a single mutex; the drain loop and the registry are the
/// only writers.
pub(crate) struct Channel {
    /// Channel name, used as the registry key and in logs
    pub name: String,
    /// Scheduling state guarded by a per-channel lock
    pub state: Mutex<ChannelState>,
}

/// Mutable scheduling state for one channel.
pub(crate) struct ChannelState {
    /// Admission policy in effect
    pub policy: Policy,
    /// Timestamp of the most recent grant (spacing policy only)
    pub last_grant: Option<Instant>,
    /// Grant timestamps still active within the trailing window (window policy only)
    pub ledger: VecDeque<Instant>,
    /// Suspended callers in arrival order
    pub queue: VecDeque<Waiter>,
    /// True while a drain loop owns this channel
    pub draining: bool,
    /// Bumped on reset so a live drain loop can detect it and exit
    pub epoch: u64,
}

impl Channel {
    pub fn new(name: &str, policy: Policy) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ChannelState {
                policy,
                last_grant: None,
                ledger: VecDeque::new(),
                queue: VecDeque::new(),
                draining: false,
                epoch: 0,
            }),
        }
    }
}

impl ChannelState {
    /// Non-blocking admission check. The only state-mutating decision point;
    /// callers must hold the channel lock for the whole evaluation.
    ///
    /// Returns `true` and consumes one unit of capacity if a slot is free.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        match self.policy {
            Policy::Spacing { interval } => {
                let due = self
                    .last_grant
                    .map_or(true, |last| now.duration_since(last) >= interval);
                if due {
                    self.last_grant = Some(now);
                }
                due
            }
            Policy::Window { window, budget } => {
                self.prune_ledger(now, window);
                if self.ledger.len() < budget {
                    self.ledger.push_back(now);
                    true
                } else {
                    trace!(occupancy = self.ledger.len(), budget, "Window exhausted");
                    false
                }
            }
        }
    }

    /// Current occupancy under a window policy, pruning expired entries first.
    pub fn occupancy(&mut self, now: Instant) -> usize {
        if let Policy::Window { window, .. } = self.policy {
            self.prune_ledger(now, window);
        }
        self.ledger.len()
    }

    /// Restore this channel to its initial empty state, keeping the policy.
    ///
    /// Queued waiters are dropped; their completion handles close, which the
    /// acquire path surfaces as an interruption error.
    pub fn clear(&mut self) {
        self.ledger.clear();
        self.queue.clear();
        self.last_grant = None;
        self.draining = false;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Drop ledger entries that have aged out of the trailing window.
    ///
    /// Each entry stops counting exactly `window` after insertion; pruning on
    /// every observation keeps occupancy identical to eager removal.
    fn prune_ledger(&mut self, now: Instant, window: std::time::Duration) {
        while let Some(&oldest) = self.ledger.front() {
            if now.duration_since(oldest) >= window {
                self.ledger.pop_front();
            } else {
                break;
            }
        }
    }
}
