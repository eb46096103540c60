//! Admission control logic and channel state management.

mod channel;
mod policy;
mod scheduler;

pub use policy::{Policy, DEFAULT_WINDOW};
pub use scheduler::{ChannelStats, Scheduler, DEFAULT_CHANNEL};
