use crate::channel::{Channel, ChannelInner};
use crate::error::{Error, Result};
use crate::handler::{CallbackRef, Handler, RefInner};
use crate::id::{EventId, IdSet, IntoIds};
use crate::ordered::OrderedMap;
use crate::pipeline::{Emission, Slot};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// Subscriber options.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Defer every invocation of the subscriber's
    /// callbacks to the next turn of the current
    /// thread, instead of running them inside the
    /// emitting call.
    pub asynchronous: bool,
}

impl Options {
    /// Options of an asynchronous subscriber.
    pub fn asynchronous() -> Self {
        Self { asynchronous: true }
    }
}

/// Subscribers registered on one id, in
/// registration order, keyed by serial.
pub(crate) type ListenerSet<K, A, R> = RefCell<OrderedMap<u64, Rc<SubscriberInner<K, A, R>>>>;

pub(crate) struct SubscriberInner<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub(crate) serial: u64,
    options: Options,
    channel: Weak<ChannelInner<K, A, R>>,
    // XXX: must be weak, the listener sets hold
    // the subscriber strongly.
    pathrefs: RefCell<OrderedMap<K, Weak<ListenerSet<K, A, R>>>>,
    callbacks: RefCell<OrderedMap<u64, Rc<RefInner<K, A, R>>>>,
    next_ref: Cell<u64>,
    retired: Cell<bool>,
}

impl<K, A, R> SubscriberInner<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub(crate) fn new(serial: u64, options: Options, channel: Weak<ChannelInner<K, A, R>>) -> Self {
        Self {
            serial,
            options,
            channel,
            pathrefs: RefCell::new(OrderedMap::new()),
            callbacks: RefCell::new(OrderedMap::new()),
            next_ref: Cell::new(0),
            retired: Cell::new(false),
        }
    }

    pub(crate) fn channel(&self) -> Option<Channel<K, A, R>> {
        self.channel.upgrade().map(Channel::from_inner)
    }

    pub(crate) fn holds(&self, serial: u64) -> bool {
        self.callbacks.borrow().contains_key(&serial)
    }

    pub(crate) fn track(&self, id: K, set: Weak<ListenerSet<K, A, R>>) {
        self.pathrefs.borrow_mut().insert(id, set);
    }

    /// Forget every registration without touching
    /// the listener sets, used when the channel
    /// drops its whole index.
    pub(crate) fn forget_paths(&self) {
        self.pathrefs.borrow_mut().clear();
    }

    /// Remove one callback reference, tearing the
    /// subscriber down when it was the last one.
    /// Returns whether the reference was still held.
    pub(crate) fn release(&self, serial: u64) -> bool {
        let removed = self.callbacks.borrow_mut().remove(&serial).is_some();
        if removed && self.callbacks.borrow().is_empty() {
            self.retire();
        }
        removed
    }

    fn retire(&self) {
        self.retired.set(true);
        let paths = std::mem::take(&mut *self.pathrefs.borrow_mut());
        let channel = self.channel.upgrade();
        for (id, set) in paths {
            let Some(set) = set.upgrade() else {
                continue;
            };
            let emptied = {
                let mut set = set.borrow_mut();
                set.remove(&self.serial);
                set.is_empty()
            };
            if !emptied {
                continue;
            }
            if let Some(channel) = &channel {
                channel.prune(&id, &set);
            }
        }
        debug!(subscriber = self.serial, "subscriber torn down");
    }

    /// Run the callbacks for one emission.
    ///
    /// Iterates a snapshot of the callback set
    /// taken on entry, so callbacks may cancel or
    /// register references freely. A once reference
    /// is cancelled right before its invocation, and
    /// skipped if a nested emission consumed it.
    pub(crate) fn trigger(&self, emission: &Emission<K, A>) -> Vec<Slot<R>> {
        let snapshot: Vec<_> = self.callbacks.borrow().values().cloned().collect();
        let mut slots = Vec::with_capacity(snapshot.len());
        for inner in snapshot {
            if inner.is_once() && !self.release(inner.serial) {
                continue;
            }
            let reference = CallbackRef { inner };
            if self.options.asynchronous {
                let ids = emission.ids.clone();
                let args = emission.args.clone();
                slots.push(Slot::Deferred(pubchan_task::defer(move || {
                    reference.invoke(&ids, &args)
                })));
            } else {
                slots.push(Slot::Ready(
                    reference.invoke(&emission.ids, &emission.args),
                ));
            }
        }
        trace!(
            subscriber = self.serial,
            callbacks = slots.len(),
            "subscriber triggered"
        );
        slots
    }
}

/// Subscriber handle.
///
/// A subscriber is a set of callback references
/// registered on one or more ids of a channel.
/// It is created by [`Channel::subscribe`],
/// registered with [`Subscriber::to`] and fed
/// with [`Subscriber::run`], [`Subscriber::once`]
/// or [`Subscriber::attach`].
///
/// The builder methods consume and return the
/// handle, so they can be chained. Handles are
/// cheap clones of the same subscriber.
///
/// Once the last of its references is cancelled,
/// the subscriber removes itself from every id and
/// is inert for good: further registrations are
/// ignored (or rejected by the `try_` methods).
pub struct Subscriber<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    inner: Rc<SubscriberInner<K, A, R>>,
}

impl<K, A, R> Clone for Subscriber<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, A, R> Subscriber<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub(crate) fn from_inner(inner: Rc<SubscriberInner<K, A, R>>) -> Self {
        Self { inner }
    }

    /// A subscriber bound to no channel.
    pub(crate) fn detached(options: Options) -> Self {
        Self::from_inner(Rc::new(SubscriberInner::new(0, options, Weak::new())))
    }

    /// Register on `ids`.
    ///
    /// Registering on an id twice is a no-op. Fails
    /// with [`Error::InvalidSubscription`] after
    /// teardown and [`Error::Closed`] once the
    /// channel is closed or gone.
    pub fn try_to<I>(self, ids: I) -> Result<Self>
    where
        I: IntoIds<K>,
    {
        if self.inner.retired.get() {
            return Err(Error::InvalidSubscription);
        }
        let channel = self.inner.channel.upgrade().ok_or(Error::Closed)?;
        if channel.is_closed() {
            return Err(Error::Closed);
        }
        let mut flat = Vec::new();
        ids.flatten_into(&mut flat);
        for id in flat {
            channel.attach(&self.inner, id);
        }
        Ok(self)
    }

    /// Register on `ids`, ignoring rejections.
    pub fn to<I>(self, ids: I) -> Self
    where
        I: IntoIds<K>,
    {
        let retained = self.clone();
        match self.try_to(ids) {
            Ok(subscriber) => subscriber,
            Err(err) => {
                warn!(subscriber = retained.inner.serial, error = %err, "registration ignored");
                retained
            }
        }
    }

    /// Add a callback reference built from `handler`.
    ///
    /// `on_complete` is called with the new
    /// reference before any event can reach it,
    /// e.g. to keep a handle for later cancelling.
    /// Fails with [`Error::InvalidSubscription`]
    /// after teardown.
    pub fn try_attach<C>(self, handler: Handler<K, A, R>, on_complete: C) -> Result<Self>
    where
        C: FnOnce(&CallbackRef<K, A, R>),
    {
        if self.inner.retired.get() {
            return Err(Error::InvalidSubscription);
        }
        let serial = self.inner.next_ref.get();
        self.inner.next_ref.set(serial + 1);
        let inner = Rc::new(RefInner::new(serial, handler, Rc::downgrade(&self.inner)));
        self.inner
            .callbacks
            .borrow_mut()
            .insert(serial, inner.clone());
        on_complete(&CallbackRef { inner });
        Ok(self)
    }

    /// Add a callback reference built from
    /// `handler`, ignoring rejections.
    pub fn attach<C>(self, handler: Handler<K, A, R>, on_complete: C) -> Self
    where
        C: FnOnce(&CallbackRef<K, A, R>),
    {
        let retained = self.clone();
        match self.try_attach(handler, on_complete) {
            Ok(subscriber) => subscriber,
            Err(err) => {
                warn!(subscriber = retained.inner.serial, error = %err, "callback ignored");
                retained
            }
        }
    }

    /// Add a callback run on every matching emission.
    pub fn run<F>(self, f: F) -> Self
    where
        F: Fn(&CallbackRef<K, A, R>, &IdSet<K>, &[A]) -> anyhow::Result<R> + 'static,
    {
        self.attach(Handler::new(f), |_| {})
    }

    /// Add a callback run on the next matching
    /// emission only.
    pub fn once<F>(self, f: F) -> Self
    where
        F: Fn(&CallbackRef<K, A, R>, &IdSet<K>, &[A]) -> anyhow::Result<R> + 'static,
    {
        self.attach(Handler::new(f).once(), |_| {})
    }

    /// Cancel every callback reference, tearing the
    /// subscriber down.
    pub fn cancel(&self) {
        let serials: Vec<u64> = self.inner.callbacks.borrow().keys().copied().collect();
        for serial in serials {
            self.inner.release(serial);
        }
        if !self.inner.retired.get() {
            // Nothing was registered, tear down anyway.
            self.inner.retire();
        }
    }

    /// Number of live callback references.
    pub fn len(&self) -> usize {
        self.inner.callbacks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the subscriber has not been torn down.
    pub fn is_active(&self) -> bool {
        !self.inner.retired.get()
    }

    pub fn is_asynchronous(&self) -> bool {
        self.inner.options.asynchronous
    }

    /// Ids the subscriber is registered on, in
    /// registration order.
    pub fn ids(&self) -> Vec<K> {
        self.inner.pathrefs.borrow().keys().cloned().collect()
    }

    pub fn channel(&self) -> Option<Channel<K, A, R>> {
        self.inner.channel()
    }
}
