//! Per-consumer delivery state for a hot stream.
//!
//! A subscription owns a FIFO buffer of undelivered signals and a demand
//! counter, and delivers on its own worker thread so a slow subscriber only
//! holds back itself. Delivery is serialized with a work-in-progress counter:
//! whoever moves it off zero wakes the worker, which stays the only deliverer
//! until the counter drains back to zero. Callbacks never overlap and may call
//! `request` or `cancel` re-entrantly. No lock is held while a callback runs.

use log::{debug, error, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, Thread};

use super::hot_stream::StreamCore;
use super::signal::Signal;
use super::value_objects::*;

/// Receives the signals of one subscription.
///
/// `on_subscribe` runs on the subscribing thread. Later callbacks run on the
/// subscription's worker thread, except for a subscriber arriving after the
/// stream terminated, which gets its terminal signal before `subscribe`
/// returns.
pub trait Subscriber<T>: Send {
    /// Called once, before any other callback.
    fn on_subscribe(&mut self, _subscription: Subscription<T>) {}

    fn on_next(&mut self, item: T);

    fn on_complete(&mut self) {}

    fn on_error(&mut self, _cause: Cause) {}
}

/// Adapter turning a closure into a subscriber with unbounded demand.
pub struct FnSubscriber<F> {
    on_next: F,
}

impl<F> FnSubscriber<F> {
    pub fn new(on_next: F) -> Self {
        Self { on_next }
    }
}

impl<T, F> Subscriber<T> for FnSubscriber<F>
where
    T: Send + 'static,
    F: FnMut(T) + Send,
{
    fn on_subscribe(&mut self, subscription: Subscription<T>) {
        subscription.request(UNBOUNDED);
    }

    fn on_next(&mut self, item: T) {
        (self.on_next)(item)
    }
}

struct DeliveryState<T> {
    buffer: VecDeque<Signal<T>>,
    demand: Demand,
    delivered: u64,
    /// A terminal signal has been enqueued; no further Next is accepted.
    closed: bool,
    /// The terminal signal has been handed to the subscriber.
    done: bool,
}


pub(crate) struct SubscriptionCell<T> {
    id: SubscriptionId,
    state: Mutex<DeliveryState<T>>,
    /// Taken out once the subscription is finished, which also drops the
    /// subscriber's own handle to this cell.
    subscriber: Mutex<Option<Box<dyn Subscriber<T>>>>,
    wip: AtomicUsize,
    cancelled: AtomicBool,
    /// Unset while delivery happens inline.
    worker: OnceLock<Thread>,
}

impl<T> SubscriptionCell<T> {
    /// The cell starts with the drain loop held so nothing reaches the
    /// subscriber before `on_subscribe` returns.
    pub(crate) fn new(subscriber: Box<dyn Subscriber<T>>) -> Self {
        Self {
            id: SubscriptionId::new(),
            state: Mutex::new(DeliveryState {
                buffer: VecDeque::new(),
                demand: Demand::None,
                delivered: 0,
                closed: false,
                done: false,
            }),
            subscriber: Mutex::new(Some(subscriber)),
            wip: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
            worker: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn enqueue_next(&self, item: T) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.buffer.push_back(Signal::Next(item));
        true
    }

    /// Complete queues behind buffered items.
    pub(crate) fn enqueue_complete(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.buffer.push_back(Signal::Complete);
    }

    /// Error discards buffered items and jumps the queue.
    pub(crate) fn enqueue_error(&self, cause: Cause) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.buffer.len();
        state.buffer.clear();
        state.buffer.push_back(Signal::Error(cause));
        if dropped > 0 {
            debug!(
                "Subscription {} discarded {} buffered items on error",
                self.id, dropped
            );
        }
    }

    pub(crate) fn add_demand(&self, n: u64) {
        if n == 0 {
            warn!("Subscription {} ignored a request for 0 items", self.id);
            return;
        }
        let mut state = self.state.lock();
        state.demand = state.demand.add(n);
    }

    /// Items this subscription can still take beyond what is already buffered.
    pub(crate) fn outstanding(&self) -> u64 {
        let state = self.state.lock();
        if state.closed || self.is_cancelled() {
            return 0;
        }
        if state.demand.is_unbounded() {
            return UNBOUNDED;
        }
        match state.demand {
            Demand::Bounded(n) => n.saturating_sub(state.buffer.len() as u64),
            _ => 0,
        }
    }

    /// Marks the cell cancelled and lets the deliverer release the
    /// subscriber. Returns false if it already was cancelled.
    pub(crate) fn mark_cancelled(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.lock().buffer.clear();
        self.drain();
        true
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        self.is_cancelled() || self.state.lock().done
    }

    /// Schedule delivery of what demand allows. The caller that moves the
    /// counter off zero wakes the worker, or drains inline without one.
    pub(crate) fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            match self.worker.get() {
                Some(worker) => worker.unpark(),
                None => self.drain_loop(),
            }
        }
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        loop {
            while let Some(signal) = self.next_deliverable() {
                self.dispatch(signal);
            }
            if self.is_finished() {
                self.release();
            }
            let remaining = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if remaining == 0 {
                break;
            }
            missed = remaining;
        }
    }

    fn next_deliverable(&self) -> Option<Signal<T>> {
        let mut state = self.state.lock();
        if self.is_cancelled() {
            state.buffer.clear();
            return None;
        }
        if state.done {
            return None;
        }
        match state.buffer.front().map(Signal::is_terminal) {
            Some(true) => {
                state.done = true;
                let terminal = state.buffer.pop_front();
                state.buffer.clear();
                terminal
            }
            Some(false) if state.demand.has_demand() => {
                state.demand = state.demand.consume();
                state.delivered += 1;
                state.buffer.pop_front()
            }
            _ => None,
        }
    }

    fn dispatch(&self, signal: Signal<T>) {
        let mut guard = self.subscriber.lock();
        let Some(subscriber) = guard.as_mut() else {
            return;
        };
        match signal {
            Signal::Next(item) => subscriber.on_next(item),
            Signal::Complete => subscriber.on_complete(),
            Signal::Error(cause) => subscriber.on_error(cause),
        }
    }

    /// Drop the subscriber. Only called by the current deliverer.
    fn release(&self) {
        let released = self.subscriber.lock().take();
        if released.is_some() {
            debug!("Subscription {} finished", self.id);
        }
    }

    fn snapshot(&self) -> (Demand, u64, usize, bool) {
        let state = self.state.lock();
        (state.demand, state.delivered, state.buffer.len(), state.done)
    }
}

impl<T: Send + 'static> SubscriptionCell<T> {
    /// Hand the subscriber its handle, then pass the held drain loop to a
    /// dedicated worker thread. A subscription that is already closed is
    /// finished inline.
    pub(crate) fn start(self: &Arc<Self>, handle: Subscription<T>) {
        if let Some(subscriber) = self.subscriber.lock().as_mut() {
            subscriber.on_subscribe(handle);
        }
        if self.state.lock().closed || self.is_cancelled() {
            self.drain_loop();
            return;
        }

        let cell = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("subscription-{}", self.id))
            .spawn(move || cell.run_worker());
        if let Err(e) = spawned {
            error!(
                "Subscription {} delivering inline, worker spawn failed: {}",
                self.id, e
            );
            self.drain_loop();
        }
    }

    fn run_worker(self: Arc<Self>) {
        // Registered before the inherited drain loop is released, so a caller
        // that later moves the counter off zero always finds the worker.
        let _ = self.worker.set(thread::current());
        loop {
            self.drain_loop();
            if self.is_finished() {
                break;
            }
            while self.wip.load(Ordering::Acquire) == 0 {
                thread::park();
            }
        }
    }
}

/// Handle to one consumer's subscription.
///
/// Cloning the handle does not create a new subscription.
pub struct Subscription<T> {
    cell: Arc<SubscriptionCell<T>>,
    stream: Weak<StreamCore<T>>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            stream: Weak::clone(&self.stream),
        }
    }
}

impl<T: Send + 'static> Subscription<T> {
    pub(crate) fn new(cell: Arc<SubscriptionCell<T>>, stream: Weak<StreamCore<T>>) -> Self {
        Self { cell, stream }
    }

    pub fn id(&self) -> SubscriptionId {
        self.cell.id()
    }

    /// Raise demand by `n` (`UNBOUNDED` for no limit) and deliver buffered items.
    pub fn request(&self, n: u64) {
        self.cell.add_demand(n);
        self.cell.drain();
    }

    /// Stop all further delivery. Other subscriptions and the stream are unaffected.
    pub fn cancel(&self) {
        if self.cell.mark_cancelled() {
            debug!("Subscription {} cancelled", self.cell.id());
            if let Some(stream) = self.stream.upgrade() {
                stream.remove(self.cell.id());
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }

    /// True once the terminal signal has been delivered.
    pub fn is_terminated(&self) -> bool {
        self.cell.snapshot().3
    }

    pub fn demand(&self) -> Demand {
        self.cell.snapshot().0
    }

    /// Number of Next signals delivered so far.
    pub fn delivered(&self) -> u64 {
        self.cell.snapshot().1
    }

    /// Signals waiting for demand.
    pub fn buffered(&self) -> usize {
        self.cell.snapshot().2
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.cell.id)
            .field("cancelled", &self.cell.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}
