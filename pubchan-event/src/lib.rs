//! In-process publish/subscribe channels.
//!
//! A [`Channel`] routes emitted event ids to the
//! [`Subscriber`]s registered on them. Each
//! subscriber carries one or more callback
//! references ([`CallbackRef`]), each holding a
//! callback or an ordered batch of callbacks
//! built with [`Handler`].
//!
//! Emitting is two steps: [`Channel::emit`]
//! captures the ids, [`Pipeline::send`] fires them
//! with arguments and returns a [`Delivery`],
//! resolving to one [`Reply`] per triggered
//! reference in dispatch order.
//!
//! Subscribers are synchronous by default: their
//! callbacks run inside `send`. With
//! [`Options::asynchronous`] they are deferred to
//! the next turn of the current thread through
//! `pubchan_task`.
//!
//! Cancellation cascades upwards: cancelling the
//! last reference of a subscriber removes it from
//! every id, and an id with no subscribers left is
//! removed from the channel.
//!
//! The crate asserts the eventing happens in a
//! single-threaded context.

#[doc(hidden)]
pub mod channel;
pub use channel::{Channel, new_channel};

#[doc(hidden)]
pub mod handler;
pub use handler::{Callback, CallbackRef, Handler, Reply};

#[doc(hidden)]
pub mod subscriber;
pub use subscriber::{Options, Subscriber};

#[doc(hidden)]
pub mod pipeline;
pub use pipeline::{Delivery, Pipeline};

pub mod id;
#[rustfmt::skip]
pub use id::{
    ALL, CLOSED,
    EventId, IdSet, IntoIds, Token,
};

pub mod error;
pub use error::{Error, Result};

pub mod ordered;

pub mod prelude {
    //! Prelude to making life easy for
    //! [this module](crate) users.
    //!
    //! The traits are imported anonymously, so
    //! that their methods are visible. The types
    //! must be imported explicitly.
    pub use crate::EventId as _;
    pub use crate::IntoIds as _;
}

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod testutil;
