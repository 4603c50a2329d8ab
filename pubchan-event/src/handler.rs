use crate::channel::Channel;
use crate::id::{EventId, IdSet};
use crate::subscriber::{Subscriber, SubscriberInner};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Callback signature.
///
/// A callback receives its own reference (to
/// cancel itself, reach its subscriber or keep
/// state), the set of emitted ids, and the
/// arguments passed to `send`.
pub type Callback<K, A, R> = dyn Fn(&CallbackRef<K, A, R>, &IdSet<K>, &[A]) -> anyhow::Result<R>;

/// Result of one callback reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<R> {
    /// Return value of a single callback.
    One(R),

    /// Return values of a batch, in batch order.
    Batch(Vec<R>),
}

impl<R> Reply<R> {
    /// The return value of a single callback.
    pub fn one(self) -> Option<R> {
        match self {
            Reply::One(r) => Some(r),
            Reply::Batch(_) => None,
        }
    }

    /// All return values, in batch order.
    pub fn into_vec(self) -> Vec<R> {
        match self {
            Reply::One(r) => vec![r],
            Reply::Batch(rs) => rs,
        }
    }
}

enum Callbacks<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    One(Rc<Callback<K, A, R>>),
    Batch(Vec<Rc<Callback<K, A, R>>>),
}

/// Handler for registering callbacks.
///
/// A handler is either a single callback, or an
/// ordered batch of callbacks sharing a single
/// reference: they receive the same arguments,
/// are cancelled together, and report their
/// return values as one [`Reply::Batch`].
pub struct Handler<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    callbacks: Callbacks<K, A, R>,
    once: bool,
}

impl<K, A, R> Handler<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CallbackRef<K, A, R>, &IdSet<K>, &[A]) -> anyhow::Result<R> + 'static,
    {
        Self {
            callbacks: Callbacks::One(Rc::new(f)),
            once: false,
        }
    }

    /// Append a callback, turning the handler into
    /// a batch.
    pub fn and<F>(self, f: F) -> Self
    where
        F: Fn(&CallbackRef<K, A, R>, &IdSet<K>, &[A]) -> anyhow::Result<R> + 'static,
    {
        let f: Rc<Callback<K, A, R>> = Rc::new(f);
        let callbacks = match self.callbacks {
            Callbacks::One(first) => Callbacks::Batch(vec![first, f]),
            Callbacks::Batch(mut batch) => {
                batch.push(f);
                Callbacks::Batch(batch)
            }
        };
        Self {
            callbacks,
            once: self.once,
        }
    }

    /// Fire on the next matching emission only.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn is_once(&self) -> bool {
        self.once
    }
}

pub(crate) struct RefInner<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub(crate) serial: u64,
    callbacks: Callbacks<K, A, R>,
    once: bool,
    state: RefCell<HashMap<TypeId, Box<dyn Any>>>,
    subscriber: Weak<SubscriberInner<K, A, R>>,
}

impl<K, A, R> RefInner<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub(crate) fn new(
        serial: u64,
        handler: Handler<K, A, R>,
        subscriber: Weak<SubscriberInner<K, A, R>>,
    ) -> Self {
        Self {
            serial,
            callbacks: handler.callbacks,
            once: handler.once,
            state: RefCell::new(HashMap::new()),
            subscriber,
        }
    }

    pub(crate) fn is_once(&self) -> bool {
        self.once
    }
}

/// Callback reference handle.
///
/// This is the handle of one registration made by
/// [`Subscriber::run`], [`Subscriber::once`] or
/// [`Subscriber::attach`]. It is handed to the
/// callback on every invocation, and to the
/// completion hook of `attach`, and can be cloned
/// and kept freely.
///
/// Cancelling the last reference of a subscriber
/// tears the subscriber down.
pub struct CallbackRef<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub(crate) inner: Rc<RefInner<K, A, R>>,
}

impl<K, A, R> Clone for CallbackRef<K, A, R>
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

impl<K, A, R> CallbackRef<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    fn cancel_option(&self) -> Option<()> {
        let subscriber = self.inner.subscriber.upgrade()?;
        subscriber.release(self.inner.serial);
        Some(())
    }

    /// Cancel this reference.
    ///
    /// Future emissions no longer reach it. An
    /// invocation already scheduled still runs.
    /// Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.cancel_option();
    }

    pub fn is_once(&self) -> bool {
        self.inner.is_once()
    }

    /// Whether the reference is still registered
    /// on its subscriber.
    pub fn is_active(&self) -> bool {
        self.inner
            .subscriber
            .upgrade()
            .is_some_and(|s| s.holds(self.inner.serial))
    }

    /// The subscriber owning this reference.
    pub fn subscriber(&self) -> Option<Subscriber<K, A, R>> {
        self.inner.subscriber.upgrade().map(Subscriber::from_inner)
    }

    /// The channel the owning subscriber belongs to.
    pub fn channel(&self) -> Option<Channel<K, A, R>> {
        self.inner.subscriber.upgrade()?.channel()
    }

    /// Access the state slot of type `T`.
    ///
    /// Each reference carries one slot per type,
    /// created with `T::default()` on first access.
    /// The slot is borrowed for the duration of `f`,
    /// which must not access the same reference's
    /// state again.
    pub fn with_state<T, O, F>(&self, f: F) -> O
    where
        T: Default + 'static,
        F: FnOnce(&mut T) -> O,
    {
        let mut state = self.inner.state.borrow_mut();
        let slot = state
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()));
        match slot.downcast_mut::<T>() {
            Some(value) => f(value),
            None => unreachable!("state slot is keyed by its own type"),
        }
    }

    pub(crate) fn invoke(&self, ids: &IdSet<K>, args: &[A]) -> anyhow::Result<Reply<R>> {
        match &self.inner.callbacks {
            Callbacks::One(f) => f(self, ids, args).map(Reply::One),
            Callbacks::Batch(batch) => {
                // Every callback of the batch runs, the
                // first failure is reported.
                let mut replies = Vec::with_capacity(batch.len());
                let mut failure = None;
                for f in batch {
                    match f(self, ids, args) {
                        Ok(r) => replies.push(r),
                        Err(err) if failure.is_none() => failure = Some(err),
                        Err(_) => {}
                    }
                }
                match failure {
                    Some(err) => Err(err),
                    None => Ok(Reply::Batch(replies)),
                }
            }
        }
    }
}
