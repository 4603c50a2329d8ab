use futures::FutureExt;
use futures::channel::oneshot::{self, Canceled, Receiver};
use futures::executor::LocalSpawner;
use futures::task::{LocalSpawn, LocalSpawnExt};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{trace, warn};

type Job = Box<dyn FnOnce()>;

/// Enumeration of the deferral tiers.
///
/// A thread defers work to exactly one tier at a
/// time. The executor tier is preferred whenever
/// a spawner has been installed and is still
/// accepting tasks, otherwise jobs land in the
/// thread-local queue.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Tier {
    /// Thread-local FIFO drained by [`drain`] or
    /// by polling a queued [`Deferred`].
    Queue,

    /// Tasks spawned on an installed local
    /// executor, run on its next turn.
    Local,
}

pub(crate) enum Scheduler {
    Queue,
    Local(LocalSpawner),
}

impl Scheduler {
    fn which_tier(&self) -> Tier {
        match self {
            Scheduler::Queue => Tier::Queue,
            Scheduler::Local(_) => Tier::Local,
        }
    }

    fn live_spawner(&self) -> Option<LocalSpawner> {
        match self {
            Scheduler::Local(spawner) if spawner.status_local().is_ok() => Some(spawner.clone()),
            _ => None,
        }
    }
}

thread_local! {
    pub(crate) static SCHEDULER: RefCell<Scheduler> = const { RefCell::new(Scheduler::Queue) };
    static QUEUE: RefCell<VecDeque<Job>> = const { RefCell::new(VecDeque::new()) };
}

/// Deferred job handle.
///
/// Awaiting this handle receives the result of
/// the job. Unlike a task handle, dropping it
/// does not cancel anything: a submitted job
/// always runs, its result is just discarded.
///
/// The handle resolves to `Err(Canceled)` only
/// if the executor dropped the job unrun.
pub struct Deferred<T>
where
    T: 'static,
{
    recv: Receiver<T>,
    queued: bool,
}

impl<T> Deferred<T>
where
    T: 'static,
{
    /// Whether the job went to the fallback queue.
    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

impl<T> Future for Deferred<T>
where
    T: 'static,
{
    type Output = Result<T, Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // XXX: nobody else is guaranteed to turn the
        // queue, so the awaiting side turns it.
        if self.queued {
            drain();
        }
        self.recv.poll_unpin(cx)
    }
}

/// Installed executor guard.
///
/// Dropping the guard restores whichever tier
/// was active before [`install`] was called.
pub struct Installed {
    previous: Option<Scheduler>,
}

impl Drop for Installed {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            SCHEDULER.set(previous);
        }
    }
}

/// Install a local executor as the deferral tier
/// of the current thread.
///
/// Jobs deferred afterwards are spawned onto the
/// executor behind `spawner`, so the executor must
/// be run (e.g. `LocalPool::run_until_stalled`) for
/// them to make progress.
#[must_use = "The previous tier is restored when Installed is dropped."]
pub fn install(spawner: LocalSpawner) -> Installed {
    let previous = SCHEDULER.replace(Scheduler::Local(spawner));
    trace!("local executor installed");
    Installed {
        previous: Some(previous),
    }
}

/// Defer a job to the next turn of the finest
/// available tier of the current thread.
pub fn defer<T, F>(job: F) -> Deferred<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let (send, recv) = oneshot::channel();
    let run = move || {
        let _ = send.send(job());
    };

    if let Some(spawner) = SCHEDULER.with_borrow(Scheduler::live_spawner) {
        if let Err(err) = spawner.spawn_local(async move { run() }) {
            // XXX: the status check above makes this a
            // race with executor teardown, the job is
            // lost and the handle reports Canceled.
            warn!(error = %err, "executor rejected deferred job");
        }
        return Deferred {
            recv,
            queued: false,
        };
    }

    QUEUE.with_borrow_mut(|queue| queue.push_back(Box::new(run)));
    Deferred { recv, queued: true }
}

/// Runs the queued jobs of the current thread.
///
/// Jobs queued by the jobs being run are run in
/// the same call, in FIFO order. Returns the
/// number of jobs that ran.
pub fn drain() -> usize {
    let mut ran = 0usize;
    while let Some(job) = QUEUE.with_borrow_mut(|queue| queue.pop_front()) {
        job();
        ran += 1;
    }
    if ran > 0 {
        trace!(ran, "deferred queue drained");
    }
    ran
}

/// Returns the number of jobs waiting in the
/// queue of the current thread.
pub fn pending() -> usize {
    QUEUE.with_borrow(|queue| queue.len())
}

/// Returns the current deferral tier.
pub fn current_tier() -> Tier {
    SCHEDULER.with_borrow(Scheduler::which_tier)
}
