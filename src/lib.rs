//! Turnstile - In-Process Admission Control
//!
//! This crate implements a request-throttling admission controller that
//! protects a shared downstream resource from concurrent callers. Each
//! logical request source gets its own channel with an independent policy:
//! either minimum spacing between grants or a bounded rolling window.
//! Queued callers are granted slots in strict arrival order by a per-channel
//! drain loop.

pub mod admission;
pub mod config;
pub mod error;

pub use admission::{ChannelStats, Policy, Scheduler, DEFAULT_CHANNEL};
pub use config::{PolicyRule, ThrottleConfig};
pub use error::{Result, TurnstileError};
