//! Stage chains attached to a hot stream, reduced to a single deferred result.
//!
//! A pipeline composes filter, map and tap steps into one item function from
//! the stream's type `T` to the output type `R`, followed by a terminal
//! reducer chosen at attach time. The chain holds no per-run state, so one
//! pipeline can be attached to any number of streams.

use log::{debug, warn};
use std::fmt::Display;
use std::sync::Arc;

use super::deferred::{DeferredResult, Outcome, Resolver};
use super::errors::StreamError;
use super::hot_stream::HotStream;
use super::subscription::{Subscriber, Subscription};
use super::value_objects::*;

pub type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type Mapper<T> = Arc<dyn Fn(T) -> Result<T, String> + Send + Sync>;
type SideEffect<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// Composed item function. `Ok(None)` means the item was filtered out.
type Chain<T, R> = Arc<dyn Fn(T) -> Result<Option<R>, String> + Send + Sync>;

/// What a step does, as reported by [`Pipeline::stages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Filter,
    Map,
    Tap,
}

/// One per-item step that keeps the item type.
pub enum Stage<T> {
    /// Drop items for which the predicate is false.
    Filter(Predicate<T>),
    /// Replace the item; an error fails the whole pipeline.
    Map(Mapper<T>),
    /// Observe the item; an error is logged and ignored.
    Tap(SideEffect<T>),
}

impl<T> Stage<T> {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Filter(_) => StageKind::Filter,
            Stage::Map(_) => StageKind::Map,
            Stage::Tap(_) => StageKind::Tap,
        }
    }

    fn apply(&self, item: T) -> Result<Option<T>, String> {
        match self {
            Stage::Filter(predicate) => Ok(predicate(&item).then_some(item)),
            Stage::Map(mapper) => mapper(item).map(Some),
            Stage::Tap(effect) => {
                if let Err(e) = effect(&item) {
                    warn!("Tap stage failed, continuing: {}", e);
                }
                Ok(Some(item))
            }
        }
    }
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        match self {
            Stage::Filter(f) => Stage::Filter(Arc::clone(f)),
            Stage::Map(f) => Stage::Map(Arc::clone(f)),
            Stage::Tap(f) => Stage::Tap(Arc::clone(f)),
        }
    }
}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// How surviving items are reduced.
pub enum TerminalKind<R> {
    /// The first survivor; the subscription is cancelled right after.
    First,
    /// Every survivor, in order, once the source completes.
    Collect,
    /// Whether every survivor matches. Stops at the first mismatch.
    All(Predicate<R>),
    /// Whether any survivor matches. Stops at the first match.
    Any(Predicate<R>),
}

/// Output of [`Pipeline::attach`], shaped by the terminal kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reduction<R> {
    First(R),
    Collected(Vec<R>),
    Matched(bool),
}

impl<R> Reduction<R> {
    pub fn into_first(self) -> Option<R> {
        match self {
            Reduction::First(item) => Some(item),
            _ => None,
        }
    }

    pub fn into_collected(self) -> Option<Vec<R>> {
        match self {
            Reduction::Collected(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_matched(self) -> Option<bool> {
        match self {
            Reduction::Matched(matched) => Some(matched),
            _ => None,
        }
    }
}

trait Reducer<R>: Send + 'static {
    type Output: Clone + Send + 'static;

    /// Fold one item. `Some` ends the run early.
    fn push(&mut self, item: R) -> Option<Self::Output>;

    /// The source completed.
    fn finish(&mut self) -> Outcome<Self::Output>;
}

struct FirstReducer;

impl<R: Clone + Send + 'static> Reducer<R> for FirstReducer {
    type Output = R;

    fn push(&mut self, item: R) -> Option<R> {
        Some(item)
    }

    fn finish(&mut self) -> Outcome<R> {
        Err(StreamError::EmptyStream)
    }
}

struct CollectReducer<R>(Vec<R>);

impl<R: Clone + Send + 'static> Reducer<R> for CollectReducer<R> {
    type Output = Vec<R>;

    fn push(&mut self, item: R) -> Option<Vec<R>> {
        self.0.push(item);
        None
    }

    fn finish(&mut self) -> Outcome<Vec<R>> {
        Ok(std::mem::take(&mut self.0))
    }
}

struct MatchReducer<R> {
    predicate: Predicate<R>,
    /// The verdict that short-circuits: `false` for all, `true` for any.
    decisive: bool,
}

impl<R: Send + 'static> Reducer<R> for MatchReducer<R> {
    type Output = bool;

    fn push(&mut self, item: R) -> Option<bool> {
        if (self.predicate)(&item) == self.decisive {
            Some(self.decisive)
        } else {
            None
        }
    }

    fn finish(&mut self) -> Outcome<bool> {
        Ok(!self.decisive)
    }
}

enum KindReducer<R> {
    First,
    Collect(CollectReducer<R>),
    Match(MatchReducer<R>),
}

impl<R: Clone + Send + 'static> From<TerminalKind<R>> for KindReducer<R> {
    fn from(kind: TerminalKind<R>) -> Self {
        match kind {
            TerminalKind::First => KindReducer::First,
            TerminalKind::Collect => KindReducer::Collect(CollectReducer(Vec::new())),
            TerminalKind::All(predicate) => KindReducer::Match(MatchReducer {
                predicate,
                decisive: false,
            }),
            TerminalKind::Any(predicate) => KindReducer::Match(MatchReducer {
                predicate,
                decisive: true,
            }),
        }
    }
}

impl<R: Clone + Send + 'static> Reducer<R> for KindReducer<R> {
    type Output = Reduction<R>;

    fn push(&mut self, item: R) -> Option<Reduction<R>> {
        match self {
            KindReducer::First => FirstReducer.push(item).map(Reduction::First),
            KindReducer::Collect(inner) => inner.push(item).map(Reduction::Collected),
            KindReducer::Match(inner) => inner.push(item).map(Reduction::Matched),
        }
    }

    fn finish(&mut self) -> Outcome<Reduction<R>> {
        match self {
            KindReducer::First => Reducer::<R>::finish(&mut FirstReducer).map(Reduction::First),
            KindReducer::Collect(inner) => inner.finish().map(Reduction::Collected),
            KindReducer::Match(inner) => inner.finish().map(Reduction::Matched),
        }
    }
}

struct PipelineSubscriber<T, R, Rd: Reducer<R>> {
    chain: Chain<T, R>,
    reducer: Rd,
    resolver: Resolver<Rd::Output>,
    subscription: Option<Subscription<T>>,
    finished: bool,
}

impl<T, R, Rd> PipelineSubscriber<T, R, Rd>
where
    T: Send + 'static,
    Rd: Reducer<R>,
{
    /// Cancels before resolving so a woken waiter already sees the
    /// subscription gone.
    fn finish(&mut self, outcome: Outcome<Rd::Output>, cancel: bool) {
        self.finished = true;
        if let Some(subscription) = self.subscription.take() {
            if cancel {
                subscription.cancel();
            }
        }
        self.resolver.resolve(outcome);
    }
}

impl<T, R, Rd> Subscriber<T> for PipelineSubscriber<T, R, Rd>
where
    T: Send + 'static,
    R: Send + 'static,
    Rd: Reducer<R>,
{
    fn on_subscribe(&mut self, subscription: Subscription<T>) {
        let handle = subscription.clone();
        self.resolver.on_cancel(move || handle.cancel());
        subscription.request(UNBOUNDED);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, item: T) {
        if self.finished {
            return;
        }
        match (self.chain)(item) {
            Ok(Some(item)) => {
                if let Some(output) = self.reducer.push(item) {
                    self.finish(Ok(output), true);
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Pipeline map stage failed: {}", e);
                self.finish(Err(StreamError::Transform(e)), true);
            }
        }
    }

    fn on_complete(&mut self) {
        if !self.finished {
            let outcome = self.reducer.finish();
            self.finish(outcome, false);
        }
    }

    fn on_error(&mut self, cause: Cause) {
        if !self.finished {
            self.finish(Err(StreamError::Upstream(cause)), false);
        }
    }
}

/// A chain of stages from stream items `T` to outputs `R`, waiting to be
/// attached to a stream.
pub struct Pipeline<T, R = T> {
    stages: Vec<StageKind>,
    chain: Chain<T, R>,
}

impl<T, R> Clone for Pipeline<T, R> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
            chain: Arc::clone(&self.chain),
        }
    }
}

impl<T: 'static> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Pipeline<T> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            chain: Arc::new(|item: T| -> Result<Option<T>, String> { Ok(Some(item)) }),
        }
    }
}

impl<T: 'static, R: 'static> Pipeline<T, R> {
    fn then<U, F>(self, kind: StageKind, step: F) -> Pipeline<T, U>
    where
        U: 'static,
        F: Fn(R) -> Result<Option<U>, String> + Send + Sync + 'static,
    {
        let Pipeline { mut stages, chain } = self;
        stages.push(kind);
        Pipeline {
            stages,
            chain: Arc::new(move |item: T| -> Result<Option<U>, String> {
                match chain(item)? {
                    Some(item) => step(item),
                    None => Ok(None),
                }
            }),
        }
    }

    pub fn stage(self, stage: Stage<R>) -> Self {
        self.then(stage.kind(), move |item| stage.apply(item))
    }

    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.stage(Stage::Filter(Arc::new(predicate)))
    }

    pub fn map<U, F>(self, mapper: F) -> Pipeline<T, U>
    where
        U: 'static,
        F: Fn(R) -> U + Send + Sync + 'static,
    {
        self.then(StageKind::Map, move |item| Ok(Some(mapper(item))))
    }

    pub fn try_map<U, F, E>(self, mapper: F) -> Pipeline<T, U>
    where
        U: 'static,
        F: Fn(R) -> Result<U, E> + Send + Sync + 'static,
        E: Display,
    {
        self.then(StageKind::Map, move |item| {
            mapper(item).map(Some).map_err(|e| e.to_string())
        })
    }

    pub fn tap<F>(self, effect: F) -> Self
    where
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.stage(Stage::Tap(Arc::new(move |item| {
            effect(item);
            Ok(())
        })))
    }

    pub fn try_tap<F, E>(self, effect: F) -> Self
    where
        F: Fn(&R) -> Result<(), E> + Send + Sync + 'static,
        E: Display,
    {
        self.stage(Stage::Tap(Arc::new(move |item| {
            effect(item).map_err(|e| e.to_string())
        })))
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }
}

impl<T, R> Pipeline<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    /// Subscribe to `stream` with unbounded demand and reduce per `kind`.
    pub fn attach(&self, stream: &HotStream<T>, kind: TerminalKind<R>) -> DeferredResult<Reduction<R>> {
        self.run(stream, KindReducer::from(kind))
    }

    pub fn first(&self, stream: &HotStream<T>) -> DeferredResult<R> {
        self.run(stream, FirstReducer)
    }

    pub fn collect(&self, stream: &HotStream<T>) -> DeferredResult<Vec<R>> {
        self.run(stream, CollectReducer(Vec::new()))
    }

    pub fn all<F>(&self, stream: &HotStream<T>, predicate: F) -> DeferredResult<bool>
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.run(
            stream,
            MatchReducer {
                predicate: Arc::new(predicate),
                decisive: false,
            },
        )
    }

    pub fn any<F>(&self, stream: &HotStream<T>, predicate: F) -> DeferredResult<bool>
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.run(
            stream,
            MatchReducer {
                predicate: Arc::new(predicate),
                decisive: true,
            },
        )
    }

    fn run<Rd: Reducer<R>>(&self, stream: &HotStream<T>, reducer: Rd) -> DeferredResult<Rd::Output> {
        let (resolver, result) = DeferredResult::channel();
        stream.subscribe(PipelineSubscriber {
            chain: Arc::clone(&self.chain),
            reducer,
            resolver,
            subscription: None,
            finished: false,
        });
        result
    }
}
