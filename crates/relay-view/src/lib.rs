//! Reader-side half of the relay: merges persisted history, resumed streams
//! and the local live stream into one ordered list, and rate-limits how often
//! that list reaches the renderer.

/// Three-tier message merge engine.
pub mod merge;
/// Render-rate throttle.
pub mod throttle;
/// Merge and throttle wired together for one thread.
pub mod view;

pub use merge::{MergeStats, MessageMerge};
pub use throttle::{RenderThrottle, SubscriptionId, ThrottleConfig};
pub use view::ReaderView;
