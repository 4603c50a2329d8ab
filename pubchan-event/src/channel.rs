use crate::error::{Error, Result};
use crate::id::{EventId, IdSet, IntoIds};
use crate::ordered::OrderedMap;
use crate::pipeline::{Emission, Pipeline, Slot};
use crate::subscriber::{ListenerSet, Options, Subscriber, SubscriberInner};
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::hash::Hash;
use std::rc::Rc;
use tracing::{debug, trace, warn};

pub(crate) struct ChannelInner<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    listeners: RefCell<OrderedMap<K, Rc<ListenerSet<K, A, R>>>>,
    closed: Cell<bool>,
    next_serial: Cell<u64>,
}

impl<K, A, R> ChannelInner<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    fn new() -> Self {
        Self {
            listeners: RefCell::new(OrderedMap::new()),
            closed: Cell::new(false),
            // Serial 0 is left to detached subscribers.
            next_serial: Cell::new(1),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Add `subscriber` to the listener set of `id`,
    /// creating the set on demand.
    pub(crate) fn attach(&self, subscriber: &Rc<SubscriberInner<K, A, R>>, id: K) {
        let set = self
            .listeners
            .borrow_mut()
            .get_or_insert_with(id.clone(), Default::default)
            .clone();
        set.borrow_mut()
            .insert(subscriber.serial, subscriber.clone());
        subscriber.track(id, Rc::downgrade(&set));
    }

    /// Drop the listener set of `id` if it is `set`
    /// and has become empty.
    pub(crate) fn prune(&self, id: &K, set: &Rc<ListenerSet<K, A, R>>) {
        let mut listeners = self.listeners.borrow_mut();
        let current = listeners.get(id).is_some_and(|s| Rc::ptr_eq(s, set));
        if current && set.borrow().is_empty() {
            listeners.remove(id);
        }
    }

    /// Collect the subscribers matching `ids`.
    ///
    /// Wildcard listeners come first, then the
    /// listeners of every id in emission order, each
    /// subscriber once, at its first match.
    fn matching(&self, ids: &IdSet<K>) -> Vec<Rc<SubscriberInner<K, A, R>>> {
        let listeners = self.listeners.borrow();
        let all = K::all();
        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        for id in std::iter::once(&all).chain(ids.iter()) {
            let Some(set) = listeners.get(id) else {
                continue;
            };
            for (serial, subscriber) in set.borrow().iter() {
                if seen.insert(*serial) {
                    matched.push(subscriber.clone());
                }
            }
        }
        matched
    }

    pub(crate) fn dispatch(&self, emission: &Emission<K, A>) -> Vec<Slot<R>> {
        let matched = self.matching(&emission.ids);
        trace!(ids = ?emission.ids, matched = matched.len(), "dispatching");
        // XXX: the listener index is not borrowed
        // past this point, callbacks may re-enter.
        matched
            .iter()
            .flat_map(|subscriber| subscriber.trigger(emission))
            .collect()
    }

    fn size(&self) -> usize {
        let listeners = self.listeners.borrow();
        let mut distinct = HashSet::new();
        for set in listeners.values() {
            distinct.extend(set.borrow().keys().copied());
        }
        distinct.len()
    }

    fn clear(&self) {
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        for (_, set) in listeners {
            for (_, subscriber) in set.borrow().iter() {
                subscriber.forget_paths();
            }
        }
    }
}

/// Event channel.
///
/// The channel routes emitted ids to the
/// subscribers registered on them. It is
/// parameterized by the id type `K`, the type of
/// the arguments `A` passed to `send`, and the
/// type of the values `R` returned by callbacks.
///
/// Channel handles are cheap clones of the same
/// channel. Everything happens on the current
/// thread; callbacks are free to emit, subscribe
/// and cancel on the very channel invoking them.
pub struct Channel<K = &'static str, A = (), R = ()>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    inner: Rc<ChannelInner<K, A, R>>,
}

impl<K, A, R> Clone for Channel<K, A, R>
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

impl<K, A, R> Default for Channel<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A, R> Channel<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ChannelInner::new()),
        }
    }

    pub(crate) fn from_inner(inner: Rc<ChannelInner<K, A, R>>) -> Self {
        Self { inner }
    }

    pub(crate) fn dispatch(&self, emission: &Emission<K, A>) -> Vec<Slot<R>> {
        self.inner.dispatch(emission)
    }

    /// Create a subscriber with `options`.
    ///
    /// Fails with [`Error::Closed`] once the channel
    /// has been closed.
    pub fn try_subscribe_with(&self, options: Options) -> Result<Subscriber<K, A, R>> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        let serial = self.inner.next_serial.get();
        self.inner.next_serial.set(serial + 1);
        let inner = SubscriberInner::new(serial, options, Rc::downgrade(&self.inner));
        Ok(Subscriber::from_inner(Rc::new(inner)))
    }

    /// Create a synchronous subscriber.
    pub fn try_subscribe(&self) -> Result<Subscriber<K, A, R>> {
        self.try_subscribe_with(Options::default())
    }

    /// Create a subscriber with `options`.
    ///
    /// On a closed channel the subscriber is
    /// detached, and registering it does nothing.
    pub fn subscribe_with(&self, options: Options) -> Subscriber<K, A, R> {
        self.try_subscribe_with(options).unwrap_or_else(|err| {
            warn!(error = %err, "subscriber created detached");
            Subscriber::detached(options)
        })
    }

    /// Create a synchronous subscriber.
    pub fn subscribe(&self) -> Subscriber<K, A, R> {
        self.subscribe_with(Options::default())
    }

    /// Prepare an emission of `ids`.
    ///
    /// Nested sequences are flattened and duplicate
    /// ids are folded. Nothing is dispatched until
    /// [`Pipeline::send`] is called.
    pub fn emit<I>(&self, ids: I) -> Pipeline<K, A, R>
    where
        I: IntoIds<K>,
    {
        Pipeline::new(self.clone(), IdSet::from_ids(ids))
    }

    /// Close the channel.
    ///
    /// The first call marks the channel closed,
    /// triggers the subscribers of the closure id
    /// (and the wildcard ones) with no arguments,
    /// then drops every registration. Later calls
    /// are no-ops.
    ///
    /// Errors of the closure callbacks are logged.
    /// Deferred closure callbacks sitting in the
    /// thread-local queue are run before returning,
    /// those on an installed executor run on its
    /// next turn.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        debug!(size = self.size(), "closing channel");
        let emission = Emission::new(IdSet::from_ids(K::closed()), Rc::from(Vec::new()));
        let slots = self.inner.dispatch(&emission);
        let mut queued = Vec::new();
        for (position, slot) in slots.into_iter().enumerate() {
            match slot {
                Slot::Ready(Err(err)) => {
                    warn!(position, error = %err, "closure callback failed");
                }
                Slot::Deferred(deferred) if deferred.is_queued() => {
                    queued.push((position, deferred));
                }
                _ => {}
            }
        }
        self.inner.clear();
        if queued.is_empty() {
            return;
        }
        // XXX: nobody awaits these, so the queue
        // must be turned here.
        pubchan_task::drain();
        for (position, deferred) in queued {
            if let Some(Ok(Err(err))) = deferred.now_or_never() {
                warn!(position, error = %err, "closure callback failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Whether both handles refer to the same
    /// channel.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of distinct subscribers registered
    /// on any id.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Ids having at least one subscriber, in the
    /// order they were first registered.
    pub fn ids(&self) -> Vec<K> {
        self.inner.listeners.borrow().keys().cloned().collect()
    }

    /// Number of subscribers registered on `id`.
    pub fn listener_count<Q>(&self, id: &Q) -> usize
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner
            .listeners
            .borrow()
            .get(id)
            .map_or(0, |set| set.borrow().len())
    }
}

/// Create a channel.
pub fn new_channel<K, A, R>() -> Channel<K, A, R>
where
    K: EventId,
    A: 'static,
    R: 'static,
{
    Channel::new()
}

#[cfg(test)]
mod test {
    use crate::error::Error;
    use crate::handler::{Handler, Reply};
    use crate::id::Token;
    use crate::subscriber::Options;
    use crate::testutil::{TestFixture, init_tracing};
    use crate::{Channel, new_channel};
    use anyhow::{Result, anyhow};
    use futures::executor::block_on;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    type Chan = Channel<&'static str, &'static str, Option<&'static str>>;

    fn counter() -> (Rc<RefCell<usize>>, Rc<RefCell<usize>>) {
        let count = Rc::new(RefCell::new(0usize));
        (count.clone(), count)
    }

    #[test]
    fn test_scenario_single() -> Result<()> {
        init_tracing();
        let chan = Chan::new();
        let _sub = chan.subscribe().to("x").run(|_, _, _| Ok(Some("r1")));
        let results = block_on(chan.emit("x").send([]))?;
        assert_eq!(results, vec![Reply::One(Some("r1"))]);
        Ok(())
    }

    #[test]
    fn test_empty_match() -> Result<()> {
        let chan = Chan::new();
        let _sub = chan.subscribe().to("x").run(|_, _, _| Ok(None));
        assert!(block_on(chan.emit("nonexistent").send([]))?.is_empty());

        let bare: Channel = new_channel();
        assert!(block_on(bare.emit(()).send([]))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_idempotent_registration() {
        let chan = Chan::new();
        let sub = chan.subscribe().to("e").to("e").to(["e", "f"]);
        assert_eq!(chan.listener_count("e"), 1);
        assert_eq!(chan.listener_count("f"), 1);
        assert_eq!(chan.size(), 1);
        assert_eq!(sub.ids(), vec!["e", "f"]);
    }

    #[test]
    fn test_dedup_on_multi_match() -> Result<()> {
        let chan = Chan::new();
        let (count, seen) = counter();
        let _sub = chan.subscribe().to(["a", "b"]).run(move |_, ids, _| {
            assert!(ids.contains("a") && ids.contains("b"));
            *count.borrow_mut() += 1;
            Ok(None)
        });
        let results = block_on(chan.emit(("a", "b", ["a"])).send([]))?;
        assert_eq!(results.len(), 1);
        assert_eq!(*seen.borrow(), 1);
        Ok(())
    }

    #[test]
    fn test_once_fires_once() -> Result<()> {
        let chan = Chan::new();
        let (count, seen) = counter();
        let sub = chan.subscribe().to("a").once(move |r, _, _| {
            assert!(!r.is_active());
            *count.borrow_mut() += 1;
            Ok(Some("once"))
        });
        assert_eq!(
            block_on(chan.emit("a").send([]))?,
            vec![Reply::One(Some("once"))]
        );
        assert!(block_on(chan.emit("a").send([]))?.is_empty());
        assert!(block_on(chan.emit("a").send([]))?.is_empty());
        assert_eq!(*seen.borrow(), 1);
        assert!(!sub.is_active());
        assert_eq!(chan.size(), 0);
        Ok(())
    }

    #[test]
    fn test_once_cannot_retrigger_itself() -> Result<()> {
        let chan = Chan::new();
        let (count, seen) = counter();
        let _sub = chan.subscribe().to("loop").once(move |r, _, _| {
            *count.borrow_mut() += 1;
            if let Some(chan) = r.channel() {
                std::mem::drop(chan.emit("loop").send([]));
            }
            Ok(None)
        });
        block_on(chan.emit("loop").send([]))?;
        assert_eq!(*seen.borrow(), 1);
        Ok(())
    }

    #[test]
    fn test_once_consumed_by_nested_emission() -> Result<()> {
        let chan = Chan::new();
        let (count, seen) = counter();
        let nested = Rc::new(Cell::new(false));
        let _sub = chan
            .subscribe()
            .to("a")
            .run(move |r, _, _| {
                if !nested.replace(true)
                    && let Some(chan) = r.channel()
                {
                    std::mem::drop(chan.emit("a").send([]));
                }
                Ok(None)
            })
            .once(move |_, _, _| {
                *count.borrow_mut() += 1;
                Ok(Some("once"))
            });

        // The nested emission consumes the once
        // reference, the outer one must skip it.
        let results = block_on(chan.emit("a").send([]))?;
        assert_eq!(results, vec![Reply::One(None)]);
        assert_eq!(*seen.borrow(), 1);

        let results = block_on(chan.emit("a").send([]))?;
        assert_eq!(results, vec![Reply::One(None)]);
        assert_eq!(*seen.borrow(), 1);
        Ok(())
    }

    #[test]
    fn test_teardown_cascade() -> Result<()> {
        let chan = Chan::new();
        let stash = Rc::new(RefCell::new(Vec::new()));
        let stash_in = stash.clone();
        let _other = chan.subscribe().to("a").run(|_, _, _| Ok(None));
        let sub = chan
            .subscribe()
            .to(["a", "b", "c"])
            .attach(Handler::new(|_, _, _| Ok(None)), |r| {
                stash_in.borrow_mut().push(r.clone())
            });
        assert_eq!(chan.size(), 2);
        assert_eq!(chan.ids(), vec!["a", "b", "c"]);

        let r = stash.borrow_mut().pop().unwrap();
        r.cancel();
        assert!(!sub.is_active());
        assert_eq!(chan.size(), 1);
        assert_eq!(chan.ids(), vec!["a"]);
        assert_eq!(chan.listener_count("b"), 0);
        assert!(sub.ids().is_empty());
        Ok(())
    }

    #[test]
    fn test_wildcard() -> Result<()> {
        let chan = Chan::new();
        let (count, seen) = counter();
        let _sub = chan.subscribe().to("$all").run(move |_, _, _| {
            *count.borrow_mut() += 1;
            Ok(Some("*"))
        });
        block_on(chan.emit("x").send([]))?;
        block_on(chan.emit(["y", "z"]).send([]))?;
        block_on(chan.emit(()).send([]))?;
        assert_eq!(*seen.borrow(), 3);
        Ok(())
    }

    #[test]
    fn test_close_signals_once() -> Result<()> {
        let chan = Chan::new();
        let (closed_count, closed_seen) = counter();
        let (all_count, all_seen) = counter();
        let _closed = chan.subscribe().to("$closed").run(move |_, ids, args| {
            assert!(ids.contains("$closed"));
            assert!(args.is_empty());
            *closed_count.borrow_mut() += 1;
            Ok(None)
        });
        let _all = chan.subscribe().to("$all").run(move |_, _, _| {
            *all_count.borrow_mut() += 1;
            Ok(None)
        });
        let _plain = chan.subscribe().to("$close").run(|_, _, _| Err(anyhow!("not signaled")));

        chan.close();
        chan.close();
        assert!(chan.is_closed());
        assert_eq!(*closed_seen.borrow(), 1);
        assert_eq!(*all_seen.borrow(), 1);
        assert_eq!(chan.size(), 0);
        assert!(chan.ids().is_empty());
        Ok(())
    }

    #[test]
    fn test_deferred_closure_listener_runs() {
        init_tracing();
        let chan = Chan::new();
        let (count, seen) = counter();
        let _closed = chan
            .subscribe_with(Options::asynchronous())
            .to("$closed")
            .run(move |_, ids, _| {
                assert!(ids.contains("$closed"));
                *count.borrow_mut() += 1;
                Ok(None)
            });
        let _failing = chan
            .subscribe_with(Options::asynchronous())
            .to("$all")
            .run(|_, _, _| Err(anyhow!("logged only")));

        chan.close();
        assert_eq!(*seen.borrow(), 1);
        assert_eq!(pubchan_task::pending(), 0);

        chan.close();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn test_deferred_closure_listener_local_tier() {
        let mut fixture = TestFixture::new();
        let chan = Chan::new();
        let (count, seen) = counter();
        let _closed = chan
            .subscribe_with(Options::asynchronous())
            .to("$closed")
            .run(move |_, _, _| {
                *count.borrow_mut() += 1;
                Ok(None)
            });

        fixture.execute(async move { chan.close() }).assert_done();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn test_closed_channel_rejects() -> Result<()> {
        let chan = Chan::new();
        let sub = chan.subscribe().run(|_, _, _| Ok(None));
        chan.close();

        assert!(matches!(chan.try_subscribe(), Err(Error::Closed)));
        assert!(matches!(sub.clone().try_to("a"), Err(Error::Closed)));
        assert!(matches!(
            block_on(chan.emit("a").send([])),
            Err(Error::Closed)
        ));

        let detached = chan.subscribe().to("a").run(|_, _, _| Ok(None));
        assert!(detached.ids().is_empty());
        assert!(detached.channel().is_none());
        assert_eq!(chan.size(), 0);
        Ok(())
    }

    #[test]
    fn test_sync_failure_reaches_everyone() -> Result<()> {
        init_tracing();
        let chan = Chan::new();
        let (count, seen) = counter();
        let _failing = chan
            .subscribe()
            .to("a")
            .run(|_, _, _| Err(anyhow!("first")))
            .run(|_, _, _| Err(anyhow!("second")));
        let _healthy = chan.subscribe().to("a").run(move |_, _, _| {
            *count.borrow_mut() += 1;
            Ok(None)
        });

        let err = block_on(chan.emit("a").send([])).unwrap_err();
        assert_eq!(*seen.borrow(), 1);
        match err {
            Error::Callback { position, source } => {
                assert_eq!(position, 0);
                assert_eq!(source.to_string(), "first");
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[test]
    fn test_deferred_failure_fails_send() -> Result<()> {
        let chan = Chan::new();
        let _ok = chan.subscribe().to("a").run(|_, _, _| Ok(Some("ok")));
        let _failing = chan
            .subscribe_with(Options::asynchronous())
            .to("a")
            .run(|_, _, _| Err(anyhow!("late")));

        let err = block_on(chan.emit("a").send([])).unwrap_err();
        assert!(matches!(err, Error::Callback { position: 1, .. }));
        Ok(())
    }

    #[test]
    fn test_batch_reference() -> Result<()> {
        let chan = Chan::new();
        let stash = Rc::new(RefCell::new(None));
        let stash_in = stash.clone();
        let _sub = chan.subscribe().to("a").attach(
            Handler::new(|_, _, args| Ok(args.first().copied()))
                .and(|_, _, args| Ok(args.last().copied())),
            move |r| *stash_in.borrow_mut() = Some(r.clone()),
        );
        let results = block_on(chan.emit("a").send(["one", "two"]))?;
        assert_eq!(results, vec![Reply::Batch(vec![Some("one"), Some("two")])]);

        // The batch shares one reference.
        stash.borrow_mut().take().unwrap().cancel();
        assert!(block_on(chan.emit("a").send([]))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_snapshot_survives_reentrancy() -> Result<()> {
        let chan = Chan::new();
        let trace = Rc::new(RefCell::new(Vec::new()));

        let t1 = trace.clone();
        let first = chan.subscribe().to("a").run(move |r, _, _| {
            t1.borrow_mut().push("first");
            // Register a newcomer and cancel the
            // neighbour mid-dispatch.
            let chan = r.channel().unwrap();
            let t3 = t1.clone();
            let _ = chan.subscribe().to("a").run(move |_, _, _| {
                t3.borrow_mut().push("newcomer");
                Ok(None)
            });
            if let Some(sub) = r.subscriber() {
                sub.cancel();
            }
            Ok(None)
        });
        let t2 = trace.clone();
        let _second = chan.subscribe().to("a").run(move |_, _, _| {
            t2.borrow_mut().push("second");
            Ok(None)
        });

        let results = block_on(chan.emit("a").send([]))?;
        assert_eq!(results.len(), 2);
        assert_eq!(*trace.borrow(), vec!["first", "second"]);
        assert!(!first.is_active());

        trace.borrow_mut().clear();
        block_on(chan.emit("a").send([]))?;
        assert_eq!(*trace.borrow(), vec!["second", "newcomer"]);
        Ok(())
    }

    #[test]
    fn test_token_ids() -> Result<()> {
        let chan: Channel<Token, (), usize> = Channel::new();
        let handler = Token::new("handler");
        let lookalike = Token::new("handler");
        let _sub = chan.subscribe().to(handler.clone()).run(|_, _, _| Ok(7));
        assert!(block_on(chan.emit(lookalike).send([]))?.is_empty());
        assert_eq!(block_on(chan.emit(handler).send([]))?, vec![Reply::One(7)]);
        Ok(())
    }

    async fn async_scenario(chan: Chan) -> Result<()> {
        let _all = chan
            .subscribe()
            .to(["$all", "$close"])
            .run(|_, _, _| Ok(Some("*")));
        let sub = chan
            .subscribe_with(Options::asynchronous())
            .to(["foo", "bar"])
            .run(|r, ids, _| {
                if ids.contains("kill") {
                    if let Some(sub) = r.subscriber() {
                        sub.cancel();
                    }
                    return Ok(Some("killed"));
                }
                Ok(None)
            })
            .run(|r, ids, _| {
                if ids.contains("bar") {
                    r.cancel();
                    return Ok(Some("cancelled"));
                }
                Ok(None)
            });
        assert_eq!(chan.size(), 2);

        let results = chan.emit("bar").send([]).await?;
        assert_eq!(
            results,
            vec![
                Reply::One(Some("*")),
                Reply::One(None),
                Reply::One(Some("cancelled")),
            ]
        );
        assert_eq!(sub.len(), 1);

        let results = chan.emit("bar").send([]).await?;
        assert_eq!(results, vec![Reply::One(Some("*")), Reply::One(None)]);

        let results = chan.emit(("foo", "kill")).send(["one", "two"]).await?;
        assert_eq!(
            results,
            vec![Reply::One(Some("*")), Reply::One(Some("killed"))]
        );
        assert!(!sub.is_active());
        assert_eq!(chan.size(), 1);

        let results = chan.emit(["foo", "bar", "kill"]).send([]).await?;
        assert_eq!(results, vec![Reply::One(Some("*"))]);
        Ok(())
    }

    #[test]
    fn test_scenario_queue_tier() -> Result<()> {
        block_on(async_scenario(Chan::new()))
    }

    #[test]
    fn test_scenario_local_tier() {
        let mut fixture = TestFixture::new();
        fixture
            .execute(async { async_scenario(Chan::new()).await.unwrap() })
            .assert_done();
    }

    #[test]
    fn test_deferred_runs_after_send_returns() -> Result<()> {
        let chan = Chan::new();
        let (count, seen) = counter();
        let _sub = chan
            .subscribe_with(Options::asynchronous())
            .to("a")
            .run(move |_, _, args| {
                *count.borrow_mut() += 1;
                Ok(args.first().copied())
            });

        let delivery = chan.emit("a").send(["arg"]);
        assert_eq!(*seen.borrow(), 0);
        assert_eq!(block_on(delivery)?, vec![Reply::One(Some("arg"))]);
        assert_eq!(*seen.borrow(), 1);

        // A dropped delivery does not cancel the callback.
        std::mem::drop(chan.emit("a").send([]));
        assert_eq!(pubchan_task::drain(), 1);
        assert_eq!(*seen.borrow(), 2);
        Ok(())
    }
}
