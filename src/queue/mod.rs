//! Durable mutation queue.
//!
//! Writes that cannot complete right away (offline, or a failed call with
//! queueing requested) are parked here and replayed later:
//! - Persisted as a single JSON list so the queue survives restarts
//! - Drained oldest first, one attempt per item per pass
//! - Drained automatically on every offline to online transition
//! - Items that exhaust their attempts raise `RequestFailed`, never vanish

mod mutation;
mod request;

pub use mutation::{spawn_auto_drain, AutoDrain, MutationQueue, QueueConfig, QueueDeps, QUEUE_KEY};
pub use request::{DrainReport, QueuedRequest};
