//! # pkd-engine
//!
//! The transfer engine: a bounded-concurrency FIFO queue of transfer jobs
//! running over pooled protocol sessions.
//!
//! - **job**: `TransferJob` and its state machine (`Queued → Active →
//!   Completed | Failed | Cancelled`)
//! - **queue**: `TransferQueue`, the scheduler and public API
//! - **retry**: transient-error classification outcome and exponential backoff
//! - **resume**: partial-destination detection and resume offsets
//! - **pool**: per-endpoint session reuse, idle reaping and keepalive
//! - **events**: progress, milestone, state and error events
//! - **local**: `LocalFilesystem` over `tokio::fs`
//! - **memory**: in-process scripted session backend (tests, `memory`
//!   feature)

pub mod events;
pub mod job;
pub mod local;
pub mod pool;
pub mod queue;
pub mod resume;
pub mod retry;
mod worker;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub use events::{crossed_milestones, EventBus, EventKind, EventStream, TransferEvent};
pub use job::{JobId, JobSnapshot, JobState, StopReason, TransferJob, TransferRequest};
pub use local::TokioFilesystem;
pub use pool::{PoolStats, SessionPool};
pub use queue::{EngineDeps, TransferQueue};
pub use resume::{DiscardReason, ResumeManager, ResumePlan};
pub use retry::{RetryDecision, RetryManager};
