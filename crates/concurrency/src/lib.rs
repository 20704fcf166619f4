//! Concurrency layer for snapvault
//!
//! This crate implements the fine-grained mutual exclusion used by the
//! snapshot engine:
//! - LockRegistry: exclusive locks keyed by volume or snapshot id
//! - ResourceGuard: scoped hold, released on every exit path
//! - LockError: distinguishable acquisition failures (timeout, shutdown)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock;

pub use lock::{LockError, LockRegistry, ResourceGuard};
