//! In-process publish/subscribe channels with
//! cancellable callbacks.
//!
//! This crate gathers the pubchan crates:
//!
//! - [`event`]: channels, subscribers, callback
//!   references and the emission pipeline.
//! - [`task`]: the per-thread deferral tiers
//!   asynchronous subscribers run on.
//! - [`registry`]: one channel per key, with
//!   closed channels leaving on their own.

pub use pubchan_event as event;
pub use pubchan_registry as registry;
pub use pubchan_task as task;

#[rustfmt::skip]
pub use pubchan_event::{
    Channel, Subscriber, Handler, CallbackRef,
    Options, Reply, Error, Result, new_channel,
};
pub use pubchan_registry::Registry;

pub mod prelude {
    //! Prelude to making life easy for
    //! [this crate](crate) users.
    pub use pubchan_event::prelude::*;
}
