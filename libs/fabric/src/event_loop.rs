//! Single-threaded event loop
//!
//! Connections, timers and handlers all run as local tasks on one thread.
//! Nothing here is `Send`, so the compiler keeps every session object on
//! the loop's thread.

use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};
use tokio::time::Instant;

use crate::error::{Error, Result};

pub struct EventLoop {
    runtime: Runtime,
    tasks: Rc<LocalSet>,
    stop: Rc<Notify>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            runtime,
            tasks: Rc::new(LocalSet::new()),
            stop: Rc::new(Notify::new()),
        })
    }

    /// Run until [`LoopHandle::stop`] is called. A stop requested while the
    /// loop was not running ends the next run immediately.
    pub fn run_forever(&self) {
        let stop = self.stop.clone();
        self.runtime
            .block_on(self.tasks.run_until(async move { stop.notified().await }));
    }

    /// Run for a fixed amount of time
    pub fn run_for(&self, duration: Duration) {
        // The timer must be created inside the runtime
        self.runtime.block_on(
            self.tasks
                .run_until(async move { tokio::time::sleep(duration).await }),
        );
    }

    /// Run until `future` completes and return its output
    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(self.tasks.run_until(future))
    }

    /// Spawn a task; it makes progress whenever the loop runs
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.tasks.spawn_local(future)
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tasks: Rc::downgrade(&self.tasks),
            stop: self.stop.clone(),
        }
    }
}

/// Non-owning handle to an [`EventLoop`]
#[derive(Clone)]
pub struct LoopHandle {
    tasks: Weak<LocalSet>,
    stop: Rc<Notify>,
}

impl LoopHandle {
    /// Spawn a task on the loop, failing if the loop has been dropped
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let tasks = self.tasks.upgrade().ok_or(Error::LoopGone)?;
        Ok(tasks.spawn_local(future))
    }

    /// Make [`EventLoop::run_forever`] return
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    pub fn is_alive(&self) -> bool {
        self.tasks.strong_count() > 0
    }
}
