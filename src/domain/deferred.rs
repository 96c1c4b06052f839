//! Single-resolution result cell shared between a producer of an outcome and
//! one waiting consumer.
//!
//! The outcome is stored, so waiting again after resolution returns it
//! immediately. Waits can be blocking (`block`, `block_timeout`) or async
//! (`wait`, `wait_timeout`); a timed-out wait leaves the underlying work
//! running.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::errors::StreamError;

pub type Outcome<R> = Result<R, StreamError>;

type Hook<R> = Box<dyn FnOnce(&Outcome<R>) + Send>;

struct Shared<R> {
    outcome: Mutex<Option<Outcome<R>>>,
    ready: Condvar,
    notify: Notify,
    hooks: Mutex<Vec<Hook<R>>>,
    canceller: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Write side of a [`DeferredResult`]. Only the first resolution counts.
pub struct Resolver<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for Resolver<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Clone + Send + 'static> Resolver<R> {
    /// Store `outcome` and wake waiters. Returns false if already resolved.
    pub fn resolve(&self, outcome: Outcome<R>) -> bool {
        let (snapshot, hooks) = {
            let mut slot = self.shared.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
            let hooks = std::mem::take(&mut *self.shared.hooks.lock());
            (outcome, hooks)
        };

        self.shared.canceller.lock().take();
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();
        for hook in hooks {
            hook(&snapshot);
        }
        true
    }

    pub fn succeed(&self, value: R) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, error: StreamError) -> bool {
        self.resolve(Err(error))
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// Action run when the consumer cancels before resolution.
    pub fn on_cancel<F>(&self, cancel: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.shared.canceller.lock() = Some(Box::new(cancel));
    }
}

/// Read side: a value or error that arrives exactly once.
pub struct DeferredResult<R> {
    shared: Arc<Shared<R>>,
}

impl<R: Clone + Send + 'static> DeferredResult<R> {
    /// A connected resolver/result pair.
    pub fn channel() -> (Resolver<R>, DeferredResult<R>) {
        let shared = Arc::new(Shared {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            notify: Notify::new(),
            hooks: Mutex::new(Vec::new()),
            canceller: Mutex::new(None),
        });
        (
            Resolver {
                shared: Arc::clone(&shared),
            },
            DeferredResult { shared },
        )
    }

    /// An already resolved result.
    pub fn ready(outcome: Outcome<R>) -> Self {
        let (resolver, result) = Self::channel();
        resolver.resolve(outcome);
        result
    }

    pub fn try_get(&self) -> Option<Outcome<R>> {
        self.shared.outcome.lock().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// Park the calling thread until resolution.
    pub fn block(&self) -> Outcome<R> {
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Like [`block`](Self::block) but gives up after `timeout`.
    pub fn block_timeout(&self, timeout: Duration) -> Outcome<R> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                return match slot.as_ref() {
                    Some(outcome) => outcome.clone(),
                    None => Err(StreamError::Timeout(timeout)),
                };
            }
        }
    }

    pub async fn wait(&self) -> Outcome<R> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Outcome<R> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StreamError::Timeout(timeout)),
        }
    }

    /// Cancel the work behind this result. A pending result resolves with
    /// `StreamError::Cancelled`.
    pub fn cancel(&self) {
        let canceller = self.shared.canceller.lock().take();
        if let Some(cancel) = canceller {
            debug!("Cancelling deferred result");
            cancel();
        }
        Resolver {
            shared: Arc::clone(&self.shared),
        }
        .resolve(Err(StreamError::Cancelled));
    }

    /// Run `hook` with the outcome once resolved, immediately if it already is.
    pub fn on_outcome<F>(&self, hook: F)
    where
        F: FnOnce(&Outcome<R>) + Send + 'static,
    {
        let resolved = {
            let slot = self.shared.outcome.lock();
            match slot.as_ref() {
                Some(outcome) => outcome.clone(),
                None => {
                    self.shared.hooks.lock().push(Box::new(hook));
                    return;
                }
            }
        };
        hook(&resolved);
    }
}

impl<R> std::fmt::Debug for DeferredResult<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredResult")
            .field("resolved", &self.shared.outcome.lock().is_some())
            .finish()
    }
}
