//! Admission policy types and budget arithmetic.

use std::time::Duration;

/// Default window duration when a window policy is configured without one.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default per-window request count for lazily created channels.
pub const DEFAULT_REQUESTS_PER_WINDOW: f64 = 10.0;

/// How a channel decides whether a caller may proceed.
///
/// Selected per channel at configuration time; both variants are independent
/// per channel and never interact across channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    /// No two grants closer than a fixed interval.
    Spacing {
        /// Minimum spacing between consecutive grants
        interval: Duration,
    },
    /// No more than `budget` grants counted over a trailing window.
    Window {
        /// Trailing window duration
        window: Duration,
        /// Maximum number of grants active within the window
        budget: usize,
    },
}

impl Policy {
    /// Build a window policy from a requested per-window request count.
    ///
    /// The enforced budget is `max(2, floor(requested)) - 1`: one slot of the
    /// requested count is reserved as headroom for the request currently in
    /// flight, so the usable budget is always one less than requested, with a
    /// floor of 1. Non-finite or below-minimum input is clamped, not
    /// rejected.
    pub fn window_from_limit(requested: f64, window: Duration) -> Self {
        Policy::Window {
            window,
            budget: effective_budget(requested),
        }
    }

    /// The enforced budget for this policy. Zero for spacing policies, which
    /// have no occupancy concept.
    pub fn budget(&self) -> usize {
        match self {
            Policy::Spacing { .. } => 0,
            Policy::Window { budget, .. } => *budget,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::window_from_limit(DEFAULT_REQUESTS_PER_WINDOW, DEFAULT_WINDOW)
    }
}

/// Compute the enforced budget for a requested per-window count.
pub(crate) fn effective_budget(requested: f64) -> usize {
    let floored = if requested.is_finite() {
        requested.floor()
    } else {
        2.0
    };
    (floored.max(2.0) as usize) - 1
}
