//! The pull-based stream primitive.
//!
//! A [`Source`] is an ordered, possibly infinite sequence of chunks ending in
//! either a successful close or a terminal error. It is produced behind a
//! [`Controller`] and consumed through a [`Reader`]. Ownership stands in for
//! the usual read-lock discipline: a `Source` is not `Clone`, so exactly one
//! consumer can ever hold it, and converting it into a `Reader` is the only
//! way to read.
//!
//! Sources are born idle. The producer is not started when the source is
//! built; the first read fires a one-shot starter hook which, for ordinary
//! sources, spawns the producer task. Dropping an unread source drops the
//! hook (and everything the producer captured) without ever running it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;

use crate::error::StreamError;
use crate::strategy::QueuingStrategy;
use crate::sync::Latch;

mod controller;
mod into_source;
mod reader;

pub use controller::{Controller, Terminated};
pub use into_source::IntoSource;
pub use reader::Reader;

/// A pull-based stream of chunks.
///
/// The strategy attached to a source doubles as the pipe-level default: an
/// operator applied to this source builds its own output with the same
/// strategy unless overridden, so a [`with_strategy`](Source::with_strategy)
/// call configures the rest of the chain.
pub struct Source<T> {
    inner: Option<Arc<Inner<T>>>,
    strategy: QueuingStrategy,
}

pub(crate) struct Inner<T> {
    state: Mutex<State<T>>,
    /// Consumer side: a chunk was enqueued or the stream terminated.
    readable: Latch,
    /// Producer side: demand opened, a read parked, or the consumer
    /// cancelled.
    writable: Latch,
}

pub(crate) enum Terminal {
    Closed,
    Errored(StreamError),
}

pub(crate) struct State<T> {
    pub(crate) queue: VecDeque<T>,
    pub(crate) high_water_mark: usize,
    pub(crate) terminal: Option<Terminal>,
    pub(crate) cancelled: bool,
    pub(crate) cancel_reason: Option<String>,
    pub(crate) started: bool,
    pub(crate) starter: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) reader_parked: bool,
}

impl<T> Inner<T> {
    fn new(high_water_mark: usize) -> Self {
        Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                high_water_mark,
                terminal: None,
                cancelled: false,
                cancel_reason: None,
                started: false,
                starter: None,
                reader_parked: false,
            }),
            readable: Latch::new(),
            writable: Latch::new(),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn readable(&self) -> &Latch {
        &self.readable
    }

    pub(crate) fn writable(&self) -> &Latch {
        &self.writable
    }

    /// Consumer-side cancellation: discard buffered chunks, close the stream
    /// and leave the reason for the producer to pick up. Idempotent; the
    /// first reason wins. The starter hook of a never-read source is dropped
    /// unrun, which releases whatever the producer had captured.
    pub(crate) fn cancel(&self, reason: Option<String>) {
        let starter = {
            let mut state = self.state();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.cancel_reason = reason;
            state.queue.clear();
            if state.terminal.is_none() {
                state.terminal = Some(Terminal::Closed);
            }
            state.starter.take()
        };
        drop(starter);
        self.readable.signal();
        self.writable.signal();
    }
}

impl<T: Send + 'static> Source<T> {
    /// Create a source driven by `producer`.
    ///
    /// The producer receives the emission [`Controller`] and is spawned as
    /// its own task on the first read. It owns the full lifecycle: it must
    /// call [`Controller::close`] on success. Returning an error terminates
    /// the stream with that error.
    pub fn new<F, Fut>(strategy: QueuingStrategy, producer: F) -> Self
    where
        F: FnOnce(Controller<T>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StreamError>> + Send + 'static,
    {
        let (source, _) = Self::with_controller(strategy, move |controller| {
            let monitor = controller.clone();
            tokio::spawn(async move {
                if let Err(error) = producer(controller).await {
                    monitor.error(error);
                }
            });
        });
        source
    }

    /// Create an idle source together with its controller.
    ///
    /// `on_first_pull` runs exactly once, when the first read parks on the
    /// source. Used where the producing side is shared between several
    /// outputs (the `tee` coordinator) rather than a dedicated task.
    pub(crate) fn with_controller(
        strategy: QueuingStrategy,
        on_first_pull: impl FnOnce(Controller<T>) + Send + 'static,
    ) -> (Self, Controller<T>) {
        let inner = Arc::new(Inner::new(strategy.high_water_mark));
        let controller = Controller::new(inner.clone());
        {
            let hooked = controller.clone();
            inner.state().starter = Some(Box::new(move || on_first_pull(hooked)));
        }
        (
            Source {
                inner: Some(inner),
                strategy,
            },
            controller,
        )
    }

    /// Acquire the exclusive reader for this source.
    pub fn into_reader(mut self) -> Reader<T> {
        Reader::new(self.take_inner())
    }

    /// Cancel the source without reading it.
    pub fn cancel_with_reason(mut self, reason: impl Into<String>) {
        self.take_inner().cancel(Some(reason.into()));
    }

    /// Bridge into a [`futures::Stream`] of results. The terminal error, if
    /// any, is yielded as the final item.
    pub fn into_stream(self) -> impl Stream<Item = crate::error::Result<T>> {
        futures::stream::unfold(Some(self.into_reader()), |reader| async move {
            let mut reader = reader?;
            match reader.read().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }

    fn take_inner(&mut self) -> Arc<Inner<T>> {
        self.inner.take().expect("source handle already consumed")
    }
}

impl<T> Source<T> {
    /// The strategy downstream operators inherit from this source.
    pub fn strategy(&self) -> QueuingStrategy {
        self.strategy
    }

    /// Override the strategy for the operators applied after this call.
    pub fn with_strategy(mut self, strategy: QueuingStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

impl<T> Drop for Source<T> {
    fn drop(&mut self) {
        // An abandoned handle counts as disinterest: cancel cooperatively so
        // producers and upstream readers unwind.
        if let Some(inner) = self.inner.take() {
            inner.cancel(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    fn counting(
        limit: usize,
        produced: Arc<AtomicUsize>,
        saw_cancel: Arc<AtomicBool>,
    ) -> Source<usize> {
        Source::new(QueuingStrategy::new(2), move |controller| async move {
            for n in 0..limit {
                match controller.ready().await {
                    Ok(()) => {}
                    Err(Terminated::Cancelled(_)) => {
                        saw_cancel.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                    Err(Terminated::Closed) => return Ok(()),
                }
                if controller.enqueue(n).is_err() {
                    saw_cancel.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                produced.fetch_add(1, Ordering::SeqCst);
            }
            controller.close();
            Ok(())
        })
    }

    #[tokio::test]
    async fn reads_chunks_then_done() {
        let source = counting(3, Arc::default(), Arc::default());
        let mut reader = source.into_reader();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), None);
        // Reading past the end stays done.
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn producer_is_not_started_until_first_read() {
        let produced = Arc::new(AtomicUsize::new(0));
        let source = counting(3, produced.clone(), Arc::default());
        tokio::task::yield_now().await;
        assert_eq!(produced.load(Ordering::SeqCst), 0);

        let mut reader = source.into_reader();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        assert!(produced.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn producer_respects_high_water_mark() {
        let produced = Arc::new(AtomicUsize::new(0));
        let source = counting(100, produced.clone(), Arc::default());
        let mut reader = source.into_reader();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        tokio::task::yield_now().await;
        // One consumed plus at most the two buffered by the mark.
        assert!(produced.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancel_reaches_the_producer() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let source = counting(100, Arc::default(), saw_cancel.clone());
        let mut reader = source.into_reader();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        reader.cancel_with_reason("lost interest");
        timeout(Duration::from_secs(1), async {
            while !saw_cancel.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("producer must observe cancellation");
    }

    #[tokio::test]
    async fn dropping_the_reader_cancels() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let source = counting(100, Arc::default(), saw_cancel.clone());
        let mut reader = source.into_reader();
        assert_eq!(reader.read().await.unwrap(), Some(0));
        drop(reader);
        timeout(Duration::from_secs(1), async {
            while !saw_cancel.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("producer must observe the dropped reader");
    }

    #[tokio::test]
    async fn error_is_terminal_and_discards_the_buffer() {
        let source = Source::new(QueuingStrategy::default(), |controller| async move {
            controller.ready().await.ok();
            controller.enqueue(1).ok();
            controller.enqueue(2).ok();
            controller.error(StreamError::msg("boom"));
            // Late emissions after the terminal event are swallowed.
            assert!(controller.enqueue(3).is_err());
            Ok(())
        });
        let mut reader = source.into_reader();
        // Chunks enqueued before the error may be observed or not depending
        // on scheduling; the error must surface in any case.
        let error = loop {
            match reader.read().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream must error, not close"),
                Err(error) => break error,
            }
        };
        assert_eq!(error.to_string(), "boom");
    }

    #[tokio::test]
    async fn close_drains_buffered_chunks() {
        let source = Source::new(QueuingStrategy::default(), |controller| async move {
            controller.ready().await.ok();
            controller.enqueue(1).ok();
            controller.enqueue(2).ok();
            controller.close();
            Ok(())
        });
        let mut reader = source.into_reader();
        assert_eq!(reader.read().await.unwrap(), Some(1));
        assert_eq!(reader.read().await.unwrap(), Some(2));
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_an_unread_source_never_starts_it() {
        let produced = Arc::new(AtomicUsize::new(0));
        let source = counting(3, produced.clone(), Arc::default());
        drop(source);
        tokio::task::yield_now().await;
        assert_eq!(produced.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn into_stream_yields_chunks_and_end() {
        use futures_util::StreamExt;
        let source = counting(2, Arc::default(), Arc::default());
        let collected: Vec<_> = source.into_stream().collect().await;
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].as_ref().unwrap(), &0);
        assert_eq!(collected[1].as_ref().unwrap(), &1);
    }
}
