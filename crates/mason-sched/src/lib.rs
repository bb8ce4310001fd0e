#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The mason job scheduler: a pipeline of queues driving elements through
//! tracked → fetched → built → pushed stages, with each action executed in an
//! isolated child worker process under a per-resource concurrency budget.
//!
//! The parent stays single-threaded-cooperative: one `select!` loop owns all
//! queue and job state, and every piece of parallelism lives in a worker
//! process that streams typed [`envelope::Envelope`]s back over its stdout.

/// Typed parent↔worker messages and their length-prefixed wire format.
pub mod envelope;

/// Parent-side job handles: spawning, draining, suspend/terminate, retries.
pub mod job;

/// The queue framework: one pipeline stage's FIFO plus its behavior hooks.
pub mod queue;

/// The scheduler event loop, run state and signal integration.
pub mod scheduler;

/// Unix signal plumbing shared by parent and workers.
pub mod signals;

/// Concurrency tokens per resource class.
pub mod tokens;

/// The worker-process side: runs one action and reports back.
pub mod worker;

pub use envelope::{Envelope, WorkerRequest};
pub use job::{WorkItem, WorkerLauncher};
pub use queue::{Queue, QueueBehavior, QueueStatus, QueueSummary};
pub use scheduler::{
    ErrorAction, RunOutcome, SchedStatus, Scheduler, SchedulerConfig, SchedulerHandle,
};
pub use tokens::{ResourceClass, TokenPool};
pub use worker::{ActionRunner, worker_main};
