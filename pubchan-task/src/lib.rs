//! Cooperative deferral for event callbacks.
//!
//! Everything in pubchan runs on a single thread,
//! and "asynchronous" only ever means "later on
//! the same thread". This crate owns that notion
//! of later.
//!
//! A job is submitted to the finest tier the
//! current thread offers:
//!
//! - When a local executor has been installed by
//!   [`install`], the job becomes a task on that
//!   executor and runs on its next turn, right
//!   after whatever is currently being polled.
//! - Otherwise the job is pushed to a thread-local
//!   FIFO. The queue is turned by [`drain`], and by
//!   the [`Deferred`] handles of queued jobs when
//!   they are polled, so awaiting a result is
//!   always enough to make it progress.
//!
//! Either way, a submitted job always runs exactly
//! once. There is no cancellation in flight.

#[doc(hidden)]
pub mod spawner;
#[rustfmt::skip]
pub use spawner::{
    Deferred, Installed, Tier,
    current_tier, defer, drain,
    install, pending,
};
