//! Creation functions: the entry points that turn ordinary values such as
//! iterables, futures, [`futures::Stream`]s, factories and timers into
//! [`Source`]s.
//!
//! Every creator is lazy: nothing is computed, iterated or scheduled until
//! the first read parks on the returned source.

use std::future::Future;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::error::StreamError;
use crate::ops::forward::pump;
use crate::source::{IntoSource, Source};
use crate::strategy::QueuingStrategy;

/// A source over any iterable.
///
/// The iterator is not advanced until the first pull, and each call builds
/// a fresh source, so a cloneable collection can be replayed by calling
/// `from_iter` again.
pub fn from_iter<I>(items: I) -> Source<I::Item>
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send,
    I::Item: Send + 'static,
{
    Source::new(QueuingStrategy::default(), move |controller| async move {
        for item in items {
            if controller.ready().await.is_err() {
                return Ok(());
            }
            if controller.enqueue(item).is_err() {
                return Ok(());
            }
        }
        controller.close();
        Ok(())
    })
}

/// Bridge a [`futures::Stream`] into a source.
pub fn from_stream<S>(stream: S) -> Source<S::Item>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            if controller.ready().await.is_err() {
                return Ok(());
            }
            match stream.next().await {
                Some(item) => {
                    if controller.enqueue(item).is_err() {
                        return Ok(());
                    }
                }
                None => {
                    controller.close();
                    return Ok(());
                }
            }
        }
    })
}

/// Bridge a fallible [`futures::Stream`]; the first `Err` item terminates
/// the source with that error.
pub fn from_try_stream<S, T, E>(stream: S) -> Source<T>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<anyhow::Error>,
{
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            if controller.ready().await.is_err() {
                return Ok(());
            }
            match stream.next().await {
                Some(Ok(item)) => {
                    if controller.enqueue(item).is_err() {
                        return Ok(());
                    }
                }
                Some(Err(error)) => return Err(StreamError::from(error.into())),
                None => {
                    controller.close();
                    return Ok(());
                }
            }
        }
    })
}

/// A single-chunk source resolving `future`. The future is not polled until
/// the first pull.
pub fn from_future<F>(future: F) -> Source<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Source::new(QueuingStrategy::default(), move |controller| async move {
        if controller.ready().await.is_err() {
            return Ok(());
        }
        let value = future.await;
        if controller.enqueue(value).is_ok() {
            controller.close();
        }
        Ok(())
    })
}

/// Defer source construction to subscription time: `factory` runs on the
/// first pull and its result is forwarded unchanged.
pub fn defer<F, S>(factory: F) -> Source<S::Item>
where
    F: FnOnce() -> S + Send + 'static,
    S: IntoSource + Send + 'static,
{
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let reader = factory().into_source().into_reader();
        pump(&controller, reader).await
    })
}

/// A source that closes without emitting.
pub fn empty<T: Send + 'static>() -> Source<T> {
    Source::new(QueuingStrategy::default(), |controller| async move {
        controller.close();
        Ok(())
    })
}

/// A source that fails with `error` on the first pull.
pub fn throw_error<T: Send + 'static>(error: StreamError) -> Source<T> {
    Source::new(QueuingStrategy::default(), move |_controller| async move {
        Err(error)
    })
}

/// `count` consecutive integers starting at `start`. A count of zero closes
/// immediately.
pub fn range(start: i64, count: usize) -> Source<i64> {
    from_iter((0..count as i64).map(move |offset| start + offset))
}

/// Emit `0` once `due` has elapsed, then close.
///
/// A zero due time still yields to the scheduler: the chunk is never
/// delivered synchronously with the subscription.
pub fn timer(due: Duration) -> Source<u64> {
    Source::new(QueuingStrategy::default(), move |controller| async move {
        tokio::select! {
            () = tokio::time::sleep(due) => {}
            _ = controller.closed() => return Ok(()),
        }
        if controller.ready().await.is_err() {
            return Ok(());
        }
        if controller.enqueue(0).is_ok() {
            controller.close();
        }
        Ok(())
    })
}

/// Emit `0` after `due`, then `1, 2, ...` every `period`, forever.
///
/// # Panics
///
/// Panics if `period` is zero: "Interval duration must be positive".
pub fn timer_with_period(due: Duration, period: Duration) -> Source<u64> {
    assert!(
        period > Duration::ZERO,
        "Interval duration must be positive"
    );
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let mut deadline = Instant::now() + due;
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                _ = controller.closed() => return Ok(()),
            }
            if controller.ready().await.is_err() {
                return Ok(());
            }
            if controller.enqueue(tick).is_err() {
                return Ok(());
            }
            tick += 1;
            deadline += period;
        }
    })
}

/// Emit `0, 1, 2, ...` every `period`.
///
/// # Panics
///
/// Panics if `period` is zero: "Interval duration must be positive".
pub fn interval(period: Duration) -> Source<u64> {
    assert!(
        period > Duration::ZERO,
        "Interval duration must be positive"
    );
    timer_with_period(period, period)
}
