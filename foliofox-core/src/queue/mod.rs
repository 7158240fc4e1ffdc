//! Download queue engine: scheduling, transfers, retries, throttling.

pub mod bandwidth;
pub mod engine;
pub mod resources;
pub mod retry;
pub mod transfer;

pub use bandwidth::{BandwidthLimiter, TokenBucket};
pub use engine::{QueueEngine, SchedulerPass};
pub use resources::{ResourceMonitor, ResourceSample};
pub use retry::{FailureKind, RetryPolicy};
pub use transfer::{sanitize_title, TransferSettings};
