//! Controller runtime for Strata
//!
//! A deduplicating work queue keyed by resource identity, a fixed-size worker
//! pool that never runs two passes for the same key at once, a dispatcher that
//! turns store watch events into enqueues, and a periodic full resync.

#![deny(missing_docs)]

mod action;
mod controller;
mod dispatcher;
mod key;
mod queue;
mod resync;

pub use action::Action;
pub use controller::{Controller, ControllerConfig, Reconciler};
pub use dispatcher::dispatch;
pub use key::ObjectKey;
pub use queue::WorkQueue;
pub use resync::resync_loop;
