//! Broadcast engine fanning published items out to every active subscription.

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::errors::StreamError;
use super::subscription::{FnSubscriber, Subscriber, Subscription, SubscriptionCell};
use super::value_objects::*;

/// Lifecycle of a hot stream. Terminal states are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Active,
    Completed,
    Errored(Cause),
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamState::Active)
    }
}

pub(crate) struct StreamCore<T> {
    name: String,
    /// Serializes publish, terminal transitions and late subscription so every
    /// subscription sees the same total order.
    gate: Mutex<StreamState>,
    /// Insertion-ordered; locked only for add, remove and snapshot.
    subscribers: RwLock<Vec<Arc<SubscriptionCell<T>>>>,
}

impl<T: Send + 'static> StreamCore<T> {
    pub(crate) fn remove(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|cell| cell.id() != id);
    }

    fn find(&self, id: SubscriptionId) -> Option<Arc<SubscriptionCell<T>>> {
        self.subscribers
            .read()
            .iter()
            .find(|cell| cell.id() == id)
            .cloned()
    }
}

/// The last stream handle went away while subscriptions were still open.
/// They are failed so no waiter hangs and every subscriber is released.
impl<T> Drop for StreamCore<T> {
    fn drop(&mut self) {
        let orphans = std::mem::take(self.subscribers.get_mut());
        if orphans.is_empty() {
            return;
        }
        warn!(
            "Stream '{}' dropped with {} open subscriptions",
            self.name,
            orphans.len()
        );
        for cell in orphans {
            cell.enqueue_error(Cause::new("stream dropped before terminating"));
            cell.drain();
        }
    }
}

/// A hot, multi-subscriber stream.
///
/// Items published while nobody is subscribed are not retained. Cloning the
/// stream yields another handle to the same stream.
pub struct HotStream<T> {
    core: Arc<StreamCore<T>>,
}

impl<T> Clone for HotStream<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + 'static> Default for HotStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> HotStream<T> {
    pub fn new() -> Self {
        Self::named("stream")
    }

    /// A stream whose name shows up in log lines.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            core: Arc::new(StreamCore {
                name: name.into(),
                gate: Mutex::new(StreamState::Active),
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Enqueue `item` on every active subscription and wake their workers.
    /// Returns without waiting for any subscriber to run.
    pub fn publish(&self, item: T) -> Result<(), StreamError> {
        let targets = {
            let state = self.core.gate.lock();
            if state.is_terminal() {
                return Err(StreamError::Terminated);
            }
            let targets = self.core.subscribers.read().clone();
            if let Some((last, rest)) = targets.split_last() {
                for cell in rest {
                    cell.enqueue_next(item.clone());
                }
                last.enqueue_next(item);
            }
            targets
        };

        for cell in &targets {
            cell.drain();
        }
        Ok(())
    }

    /// Complete the stream. Returns false if it was already terminal.
    pub fn complete(&self) -> bool {
        let targets = {
            let mut state = self.core.gate.lock();
            if state.is_terminal() {
                return false;
            }
            *state = StreamState::Completed;
            std::mem::take(&mut *self.core.subscribers.write())
        };

        info!(
            "Stream '{}' completed ({} subscriptions)",
            self.core.name,
            targets.len()
        );
        for cell in &targets {
            cell.enqueue_complete();
            cell.drain();
        }
        true
    }

    /// Fail the stream, discarding undelivered items. Returns false if it was
    /// already terminal.
    pub fn fail(&self, cause: impl Into<Cause>) -> bool {
        let cause = cause.into();
        let targets = {
            let mut state = self.core.gate.lock();
            if state.is_terminal() {
                return false;
            }
            *state = StreamState::Errored(cause.clone());
            std::mem::take(&mut *self.core.subscribers.write())
        };

        info!(
            "Stream '{}' failed: {} ({} subscriptions)",
            self.core.name,
            cause,
            targets.len()
        );
        for cell in &targets {
            cell.enqueue_error(cause.clone());
            cell.drain();
        }
        true
    }

    /// Register `subscriber`. A subscriber arriving after termination receives
    /// only the terminal signal, before this call returns.
    pub fn subscribe<S>(&self, subscriber: S) -> Subscription<T>
    where
        S: Subscriber<T> + 'static,
    {
        let cell = Arc::new(SubscriptionCell::new(Box::new(subscriber)));
        let handle = Subscription::new(Arc::clone(&cell), Arc::downgrade(&self.core));

        {
            let state = self.core.gate.lock();
            match &*state {
                StreamState::Active => self.core.subscribers.write().push(Arc::clone(&cell)),
                StreamState::Completed => cell.enqueue_complete(),
                StreamState::Errored(cause) => cell.enqueue_error(cause.clone()),
            }
        }

        debug!("Stream '{}' subscribed {}", self.core.name, cell.id());
        cell.start(handle.clone());
        handle
    }

    /// Subscribe a closure with unbounded demand.
    pub fn subscribe_fn<F>(&self, on_next: F) -> Subscription<T>
    where
        F: FnMut(T) + Send + 'static,
    {
        self.subscribe(FnSubscriber::new(on_next))
    }

    /// Raise demand of subscription `id`. Returns false if it is not active.
    pub fn request(&self, id: SubscriptionId, n: u64) -> bool {
        match self.core.find(id) {
            Some(cell) => {
                cell.add_demand(n);
                cell.drain();
                true
            }
            None => false,
        }
    }

    /// Cancel subscription `id`. Returns false if it is not active.
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        match self.core.find(id) {
            Some(cell) => {
                cell.mark_cancelled();
                self.core.remove(id);
                debug!("Stream '{}' cancelled {}", self.core.name, id);
                true
            }
            None => false,
        }
    }

    /// Largest number of items any active subscription can still take on top
    /// of what it already buffers. `UNBOUNDED` if one of them has no limit.
    pub fn outstanding_demand(&self) -> u64 {
        self.core
            .subscribers
            .read()
            .iter()
            .map(|cell| cell.outstanding())
            .max()
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.core.subscribers.read().len()
    }

    pub fn state(&self) -> StreamState {
        self.core.gate.lock().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.core.gate.lock().is_terminal()
    }
}

impl<T> std::fmt::Debug for HotStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotStream")
            .field("name", &self.core.name)
            .field("state", &*self.core.gate.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    type Log = Arc<parking_lot::Mutex<Vec<Signal<String>>>>;

    struct Recorder {
        initial: u64,
        log: Log,
    }

    impl Subscriber<String> for Recorder {
        fn on_subscribe(&mut self, subscription: Subscription<String>) {
            if self.initial > 0 {
                subscription.request(self.initial);
            }
        }

        fn on_next(&mut self, item: String) {
            self.log.lock().push(Signal::Next(item));
        }

        fn on_complete(&mut self) {
            self.log.lock().push(Signal::Complete);
        }

        fn on_error(&mut self, cause: Cause) {
            self.log.lock().push(Signal::Error(cause));
        }
    }

    fn recorder(initial: u64) -> (Recorder, Log) {
        let log: Log = Arc::default();
        (
            Recorder {
                initial,
                log: Arc::clone(&log),
            },
            log,
        )
    }

    fn next(s: &str) -> Signal<String> {
        Signal::Next(s.to_string())
    }

    /// Delivery happens on worker threads, so poll for up to two seconds.
    fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn delivers_in_publish_order_with_unbounded_demand() {
        let stream = HotStream::new();
        let (sub, log) = recorder(UNBOUNDED);
        let subscription = stream.subscribe(sub);

        stream.publish("a".to_string()).unwrap();
        stream.publish("b".to_string()).unwrap();
        assert!(stream.complete());

        assert!(wait_until(|| subscription.is_terminated()));
        assert_eq!(*log.lock(), vec![next("a"), next("b"), Signal::Complete]);
    }

    #[test]
    fn bounded_demand_holds_back_items_and_completion() {
        let stream = HotStream::new();
        let (sub, log) = recorder(1);
        let subscription = stream.subscribe(sub);

        for item in ["a", "b", "c"] {
            stream.publish(item.to_string()).unwrap();
        }
        stream.complete();

        assert!(wait_until(|| subscription.buffered() == 3));
        assert_eq!(*log.lock(), vec![next("a")]);
        assert_eq!(subscription.demand(), Demand::None);

        subscription.request(1);
        assert!(wait_until(|| subscription.delivered() == 2));
        assert_eq!(log.lock().len(), 2);

        subscription.request(5);
        assert!(wait_until(|| subscription.is_terminated()));
        assert_eq!(
            *log.lock(),
            vec![next("a"), next("b"), next("c"), Signal::Complete]
        );
    }

    #[test]
    fn request_through_stream_by_id() {
        let stream = HotStream::new();
        let (sub, log) = recorder(0);
        let subscription = stream.subscribe(sub);

        stream.publish("a".to_string()).unwrap();
        assert_eq!(subscription.buffered(), 1);
        assert!(log.lock().is_empty());

        assert!(stream.request(subscription.id(), 1));
        assert!(wait_until(|| subscription.delivered() == 1));
        assert_eq!(*log.lock(), vec![next("a")]);
    }

    #[test]
    fn error_skips_buffered_items() {
        let stream = HotStream::new();
        let (sub, log) = recorder(0);
        let subscription = stream.subscribe(sub);

        stream.publish("a".to_string()).unwrap();
        stream.publish("b".to_string()).unwrap();
        assert!(stream.fail("broker down"));

        assert!(wait_until(|| subscription.is_terminated()));
        assert_eq!(*log.lock(), vec![Signal::Error(Cause::new("broker down"))]);
        assert_eq!(subscription.buffered(), 0);
    }

    #[test]
    fn publish_after_terminal_is_rejected() {
        let stream = HotStream::new();
        let (sub, log) = recorder(UNBOUNDED);
        let subscription = stream.subscribe(sub);

        stream.complete();
        assert_eq!(
            stream.publish("late".to_string()),
            Err(StreamError::Terminated)
        );
        assert!(!stream.complete());
        assert!(!stream.fail("again"));
        assert!(wait_until(|| subscription.is_terminated()));
        assert_eq!(*log.lock(), vec![Signal::Complete]);
    }

    #[test]
    fn late_subscriber_sees_only_terminal_signal() {
        let stream: HotStream<String> = HotStream::new();
        stream.fail("gone");

        let (sub, log) = recorder(0);
        let subscription = stream.subscribe(sub);

        assert_eq!(*log.lock(), vec![Signal::Error(Cause::new("gone"))]);
        assert!(subscription.is_terminated());
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn cancel_stops_delivery_without_affecting_others() {
        let stream = HotStream::new();
        let (first, first_log) = recorder(UNBOUNDED);
        let (second, second_log) = recorder(UNBOUNDED);
        let first_sub = stream.subscribe(first);
        let second_sub = stream.subscribe(second);

        stream.publish("a".to_string()).unwrap();
        assert!(wait_until(|| first_sub.delivered() == 1));
        assert!(stream.cancel(first_sub.id()));
        assert!(!stream.cancel(first_sub.id()));
        stream.publish("b".to_string()).unwrap();
        stream.complete();

        assert!(wait_until(|| second_sub.is_terminated()));
        assert_eq!(*first_log.lock(), vec![next("a")]);
        assert_eq!(
            *second_log.lock(),
            vec![next("a"), next("b"), Signal::Complete]
        );
        assert_eq!(stream.state(), StreamState::Completed);
    }

    #[test]
    fn reentrant_cancel_from_callback() {
        struct TakeOne {
            subscription: Option<Subscription<u32>>,
            seen: Arc<parking_lot::Mutex<Vec<u32>>>,
        }

        impl Subscriber<u32> for TakeOne {
            fn on_subscribe(&mut self, subscription: Subscription<u32>) {
                subscription.request(UNBOUNDED);
                self.subscription = Some(subscription);
            }

            fn on_next(&mut self, item: u32) {
                self.seen.lock().push(item);
                if let Some(subscription) = &self.subscription {
                    subscription.cancel();
                }
            }
        }

        let stream = HotStream::new();
        let seen = Arc::default();
        let subscription = stream.subscribe(TakeOne {
            subscription: None,
            seen: Arc::clone(&seen),
        });

        for i in 0..5 {
            stream.publish(i).unwrap();
        }
        assert!(wait_until(|| stream.subscriber_count() == 0));
        assert!(subscription.is_cancelled());
        assert_eq!(*seen.lock(), vec![0]);
    }

    #[test]
    fn concurrent_publishers_keep_one_total_order() {
        let stream = HotStream::new();
        let first = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let second = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let subscriptions = {
            let first = Arc::clone(&first);
            let second = Arc::clone(&second);
            [
                stream.subscribe_fn(move |item: u32| first.lock().push(item)),
                stream.subscribe_fn(move |item: u32| second.lock().push(item)),
            ]
        };

        let handles: Vec<_> = (0..4u32)
            .map(|worker| {
                let stream = stream.clone();
                std::thread::spawn(move || {
                    for i in 0..250u32 {
                        stream.publish(worker * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        stream.complete();
        assert!(wait_until(|| subscriptions.iter().all(|s| s.is_terminated())));

        let first = first.lock();
        assert_eq!(first.len(), 1000);
        assert_eq!(*first, *second.lock());
        for worker in 0..4u32 {
            let own: Vec<_> = first.iter().filter(|v| **v / 1000 == worker).collect();
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn blocked_subscriber_does_not_hold_back_others() {
        struct Gated {
            release: std::sync::mpsc::Receiver<()>,
            log: Log,
        }

        impl Subscriber<String> for Gated {
            fn on_subscribe(&mut self, subscription: Subscription<String>) {
                subscription.request(UNBOUNDED);
            }

            fn on_next(&mut self, item: String) {
                let _ = self.release.recv();
                self.log.lock().push(Signal::Next(item));
            }

            fn on_complete(&mut self) {
                self.log.lock().push(Signal::Complete);
            }
        }

        let stream = HotStream::new();
        let (release, gate) = std::sync::mpsc::channel();
        let slow_log: Log = Arc::default();
        let slow = stream.subscribe(Gated {
            release: gate,
            log: Arc::clone(&slow_log),
        });
        let (fast, fast_log) = recorder(UNBOUNDED);
        let fast = stream.subscribe(fast);

        for item in ["a", "b", "c"] {
            stream.publish(item.to_string()).unwrap();
        }
        stream.complete();

        assert!(wait_until(|| fast.is_terminated()));
        assert_eq!(
            *fast_log.lock(),
            vec![next("a"), next("b"), next("c"), Signal::Complete]
        );
        assert!(slow_log.lock().is_empty());
        assert!(!slow.is_terminated());

        drop(release);
        assert!(wait_until(|| slow.is_terminated()));
        assert_eq!(*slow_log.lock(), *fast_log.lock());
    }

    #[test]
    fn racing_publish_and_terminal_signals_end_every_log_once() {
        for _ in 0..20 {
            let stream = HotStream::new();
            let subscribers: Vec<_> = (0..3)
                .map(|_| {
                    let (sub, log) = recorder(UNBOUNDED);
                    (stream.subscribe(sub), log)
                })
                .collect();
            let published = Arc::new(AtomicUsize::new(0));

            let publishers: Vec<_> = (0..3)
                .map(|worker| {
                    let stream = stream.clone();
                    let published = Arc::clone(&published);
                    std::thread::spawn(move || {
                        for i in 0..100 {
                            if stream.publish(format!("{}-{}", worker, i)).is_ok() {
                                published.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    })
                })
                .collect();
            let completer = {
                let stream = stream.clone();
                std::thread::spawn(move || stream.complete())
            };
            let failer = {
                let stream = stream.clone();
                std::thread::spawn(move || stream.fail("raced"))
            };

            for publisher in publishers {
                publisher.join().unwrap();
            }
            let completed = completer.join().unwrap();
            let failed = failer.join().unwrap();
            assert!(completed != failed);

            for (subscription, log) in &subscribers {
                assert!(wait_until(|| subscription.is_terminated()));
                let log = log.lock();
                assert_eq!(log.iter().filter(|s| s.is_terminal()).count(), 1);
                let last = log.last().unwrap();
                if completed {
                    assert_eq!(*last, Signal::Complete);
                    assert_eq!(log.len() - 1, published.load(Ordering::SeqCst));
                } else {
                    assert_eq!(*last, Signal::Error(Cause::new("raced")));
                }
            }
        }
    }

    #[test]
    fn outstanding_demand_tracks_the_hungriest_subscriber() {
        let stream = HotStream::new();
        assert_eq!(stream.outstanding_demand(), 0);

        let (idle, _) = recorder(0);
        stream.subscribe(idle);
        assert_eq!(stream.outstanding_demand(), 0);

        let (bounded, _) = recorder(2);
        let bounded = stream.subscribe(bounded);
        assert_eq!(stream.outstanding_demand(), 2);

        stream.publish("a".to_string()).unwrap();
        assert_eq!(stream.outstanding_demand(), 1);
        assert!(wait_until(|| bounded.delivered() == 1));
        assert_eq!(stream.outstanding_demand(), 1);

        let (unbounded, _) = recorder(UNBOUNDED);
        stream.subscribe(unbounded);
        assert_eq!(stream.outstanding_demand(), UNBOUNDED);

        stream.complete();
        assert_eq!(stream.outstanding_demand(), 0);
    }

    #[test]
    fn dropping_the_stream_fails_and_releases_open_subscribers() {
        let stream = HotStream::new();
        let (sub, log) = recorder(0);
        let subscription = stream.subscribe(sub);
        stream.publish("buffered".to_string()).unwrap();

        drop(stream);

        assert!(wait_until(|| subscription.is_terminated()));
        assert_eq!(
            *log.lock(),
            vec![Signal::Error(Cause::new("stream dropped before terminating"))]
        );
        // The subscriber held the other clone of the log.
        assert!(wait_until(|| Arc::strong_count(&log) == 1));
    }
}
