//! Emission pipeline.
//!
//! `Channel::emit` captures the ids to fire in a
//! [`Pipeline`], and [`Pipeline::send`] fires
//! them: the matched subscribers are triggered
//! right away, inside the `send` call, and the
//! returned [`Delivery`] settles the results.
//!
//! Synchronous callbacks have already run when
//! `send` returns. Deferred callbacks have been
//! scheduled, and the delivery waits for them.
//! Either way the results come back in dispatch
//! order: subscriber by subscriber, reference by
//! reference.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::handler::Reply;
use crate::id::{EventId, IdSet};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use pubchan_task::Deferred;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::warn;

/// One emission being dispatched: the ids being
/// fired and the arguments delivered with them.
pub(crate) struct Emission<K, A>
where
    K: EventId,
    A: 'static,
{
    pub(crate) ids: Rc<IdSet<K>>,
    pub(crate) args: Rc<[A]>,
}

impl<K, A> Emission<K, A>
where
    K: EventId,
    A: 'static,
{
    pub(crate) fn new(ids: IdSet<K>, args: Rc<[A]>) -> Self {
        Self {
            ids: Rc::new(ids),
            args,
        }
    }
}

/// Result slot of one callback reference.
pub(crate) enum Slot<R>
where
    R: 'static,
{
    Ready(anyhow::Result<Reply<R>>),
    Deferred(Deferred<anyhow::Result<Reply<R>>>),
}

/// Emission builder returned by `Channel::emit`.
pub struct Pipeline<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    channel: Channel<K, A, R>,
    ids: IdSet<K>,
}

impl<K, A, R> Pipeline<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub(crate) fn new(channel: Channel<K, A, R>, ids: IdSet<K>) -> Self {
        Self { channel, ids }
    }

    /// The ids this pipeline fires.
    pub fn ids(&self) -> &IdSet<K> {
        &self.ids
    }

    /// Fire the ids with `args`.
    ///
    /// Matching and synchronous callbacks happen
    /// inside this call. The delivery resolves to
    /// one reply per triggered reference, or to the
    /// first error in dispatch order once every
    /// callback has settled. A closed channel
    /// resolves to [`Error::Closed`].
    #[must_use = "Deferred results are only observed by awaiting the Delivery."]
    pub fn send<I>(self, args: I) -> Delivery<R>
    where
        I: IntoIterator<Item = A>,
    {
        if self.channel.is_closed() {
            return Delivery::rejected(Error::Closed);
        }
        let emission = Emission::new(self.ids, args.into_iter().collect());
        Delivery::settle(self.channel.dispatch(&emission))
    }
}

/// Settling results of one `send`.
pub struct Delivery<R>
where
    R: 'static,
{
    future: LocalBoxFuture<'static, Result<Vec<Reply<R>>>>,
}

impl<R> Delivery<R>
where
    R: 'static,
{
    fn rejected(err: Error) -> Self {
        Self {
            future: Box::pin(async move { Err(err) }),
        }
    }

    pub(crate) fn settle(slots: Vec<Slot<R>>) -> Self {
        Self {
            future: Box::pin(settle_slots(slots)),
        }
    }
}

impl<R> Future for Delivery<R>
where
    R: 'static,
{
    type Output = Result<Vec<Reply<R>>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_unpin(cx)
    }
}

async fn settle_slots<R>(slots: Vec<Slot<R>>) -> Result<Vec<Reply<R>>>
where
    R: 'static,
{
    let mut replies = Vec::with_capacity(slots.len());
    let mut failure = None;
    for (position, slot) in slots.into_iter().enumerate() {
        let settled = match slot {
            Slot::Ready(result) => result.map_err(|source| Error::Callback { position, source }),
            Slot::Deferred(deferred) => match deferred.await {
                Ok(result) => result.map_err(|source| Error::Callback { position, source }),
                Err(_) => Err(Error::Dropped { position }),
            },
        };
        match settled {
            Ok(reply) => replies.push(reply),
            Err(err) if failure.is_none() => failure = Some(err),
            Err(err) => warn!(position, error = %err, "further callback failure"),
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(replies),
    }
}
