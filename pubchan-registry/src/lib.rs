//! Keyed channel registry.
//!
//! A [`Registry`] hands out one [`Channel`] per
//! key, creating it on first request. Every
//! channel it creates is watched for closure:
//! once closed, the channel leaves the registry
//! on its own, and the next request for its key
//! creates a fresh one.
//!
//! The registry is explicit shared state rather
//! than a global. Clone the handle to share it.

use pubchan_event::ordered::OrderedMap;
use pubchan_event::{Channel, EventId};
use std::cell::RefCell;
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use tracing::debug;

type Channels<Q, K, A, R> = RefCell<OrderedMap<Q, Channel<K, A, R>>>;

/// Registry of channels by key.
///
/// The closure watcher installed on each channel
/// is a synchronous subscriber of the closure id,
/// whose reply is `R::default()`.
pub struct Registry<Q, K = &'static str, A = (), R = ()>
where
    Q: Hash + Eq + Clone + fmt::Debug + 'static,
    K: EventId,
    A: 'static,
    R: Default + 'static,
{
    channels: Rc<Channels<Q, K, A, R>>,
}

impl<Q, K, A, R> Clone for Registry<Q, K, A, R>
where
    Q: Hash + Eq + Clone + fmt::Debug + 'static,
    K: EventId,
    A: 'static,
    R: Default + 'static,
{
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
        }
    }
}

impl<Q, K, A, R> Default for Registry<Q, K, A, R>
where
    Q: Hash + Eq + Clone + fmt::Debug + 'static,
    K: EventId,
    A: 'static,
    R: Default + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Q, K, A, R> Registry<Q, K, A, R>
where
    Q: Hash + Eq + Clone + fmt::Debug + 'static,
    K: EventId,
    A: 'static,
    R: Default + 'static,
{
    pub fn new() -> Self {
        Self {
            channels: Rc::new(RefCell::new(OrderedMap::new())),
        }
    }

    fn watch(channels: Weak<Channels<Q, K, A, R>>, key: Q, channel: &Channel<K, A, R>) {
        let _ = channel.subscribe().to(K::closed()).run(move |r, _, _| {
            if let Some(channels) = channels.upgrade() {
                let mut map = channels.borrow_mut();
                // XXX: the key may have been taken over
                // by another channel meanwhile.
                let current = map
                    .get(&key)
                    .zip(r.channel())
                    .is_some_and(|(stored, closing)| stored.ptr_eq(&closing));
                if current {
                    map.remove(&key);
                    debug!(key = ?key, "closed channel unregistered");
                }
            }
            r.cancel();
            Ok(R::default())
        });
    }

    /// Return the channel of `key`, creating and
    /// registering it if there is none.
    pub fn get_or_create(&self, key: Q) -> Channel<K, A, R> {
        if let Some(channel) = self.channels.borrow().get(&key) {
            return channel.clone();
        }
        let channel = Channel::new();
        Self::watch(Rc::downgrade(&self.channels), key.clone(), &channel);
        debug!(key = ?key, "channel registered");
        self.channels.borrow_mut().insert(key, channel.clone());
        channel
    }

    /// Alias of [`Registry::get_or_create`].
    pub fn create(&self, key: Q) -> Channel<K, A, R> {
        self.get_or_create(key)
    }

    /// Return the channel of `key`, if any. Never
    /// creates one.
    pub fn get<B>(&self, key: &B) -> Option<Channel<K, A, R>>
    where
        Q: std::borrow::Borrow<B>,
        B: Hash + Eq + ?Sized,
    {
        self.channels.borrow().get(key).cloned()
    }

    pub fn has<B>(&self, key: &B) -> bool
    where
        Q: std::borrow::Borrow<B>,
        B: Hash + Eq + ?Sized,
    {
        self.channels.borrow().contains_key(key)
    }

    /// Registered keys, in registration order.
    pub fn keys(&self) -> Vec<Q> {
        self.channels.borrow().keys().cloned().collect()
    }

    /// Registered channels, in registration order.
    pub fn values(&self) -> Vec<Channel<K, A, R>> {
        self.channels.borrow().values().cloned().collect()
    }

    /// Registered pairs, in registration order.
    pub fn entries(&self) -> Vec<(Q, Channel<K, A, R>)> {
        self.channels
            .borrow()
            .iter()
            .map(|(key, channel)| (key.clone(), channel.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.borrow().is_empty()
    }

    /// Close every registered channel.
    ///
    /// Each closure unregisters its channel, so the
    /// registry is empty afterwards.
    pub fn close_all(&self) {
        for channel in self.values() {
            channel.close();
        }
        debug!(left = self.len(), "registry drained");
    }
}
