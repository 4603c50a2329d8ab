use std::cell::RefCell;
use std::rc::Rc;

use futures::{
    executor::{LocalPool, LocalSpawner},
    task::LocalSpawnExt,
};
use pubchan_task::Installed;
use tracing_subscriber::EnvFilter;

/// Route the logs of the test to the test writer,
/// filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) struct Execute {
    done: Rc<RefCell<bool>>,
}

impl Execute {
    pub(crate) fn assert_done(&self) {
        assert!(*self.done.borrow(), "task is not done");
    }
}

/// Local pool installed as the deferral tier of
/// the test thread for as long as it lives.
pub(crate) struct TestFixture {
    // XXX: declared first, the tier must be
    // restored before the pool goes away.
    _installed: Installed,
    pool: LocalPool,
    spawner: LocalSpawner,
}

impl TestFixture {
    pub(crate) fn new() -> Self {
        init_tracing();
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self {
            _installed: pubchan_task::install(spawner.clone()),
            pool,
            spawner,
        }
    }

    pub(crate) fn execute<F>(&mut self, future: F) -> Execute
    where
        F: Future<Output = ()> + 'static,
    {
        let done = Rc::new(RefCell::new(false));
        let done_moved = done.clone();
        self.spawner
            .spawn_local(async move {
                future.await;
                *done_moved.borrow_mut() = true;
            })
            .unwrap();
        self.pool.run_until_stalled();
        Execute { done }
    }
}
