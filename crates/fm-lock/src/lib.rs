//! # fm-lock
//!
//! Per-project lock coordination and optimistic updates for Foreman.
//!
//! Two concurrency disciplines, both keyed by project id:
//!
//! - [`LockCoordinator`] — exclusive, advisory lock files with bounded
//!   exponential backoff. Held for the duration of a single logical
//!   transition, never across independent operations, so a crashed
//!   holder has a small blast radius (and its stale lock gets broken).
//! - [`atomic_update`] — a lock-free compare-and-swap loop over the
//!   record store's version counter, for simple field updates (task
//!   claiming) that don't need a lock held across multi-step logic.

pub mod atomic;
pub mod error;
pub mod lock;

pub use atomic::{atomic_update, UpdateError};
pub use error::LockError;
pub use lock::{LockConfig, LockCoordinator, LockHandle};
