//! Redis-backed shared stores for the GoodTape orchestrator.
//!
//! This crate provides:
//! - `JobStore`: one durable hash per job plus status index sets, with an
//!   atomic status compare-and-set for optimistic concurrency
//! - `LockStore`: token-authenticated, TTL-bearing processing leases
//! - `ProgressChannel`: best-effort progress fan-out via Redis Pub/Sub
//!
//! These two keyspaces are the only coordination points between API
//! instances; nothing in this crate holds in-process state across calls.

pub mod error;
pub mod jobs;
pub mod lock;
pub mod progress;

pub use error::{StoreError, StoreResult};
pub use jobs::{JobStore, StatusCas};
pub use lock::{LockInfo, LockStore};
pub use progress::{ProgressChannel, ProgressEvent};
