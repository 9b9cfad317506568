//! Operators that truncate a stream: by count, by predicate, or by a
//! second stream acting as a stop signal.

use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::source::Source;

use super::forward::{apply, apply_fn, cancel_reader, Stage, Step};

struct FindLastStage<T, F> {
    predicate: F,
    latest: Option<T>,
}

impl<T, F> Stage<T, T> for FindLastStage<T, F>
where
    T: Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    fn on_chunk(&mut self, chunk: T) -> Result<Step<T>, StreamError> {
        if (self.predicate)(&chunk) {
            self.latest = Some(chunk);
        }
        Ok(Step::Skip)
    }

    fn on_close(&mut self) -> Option<T> {
        self.latest.take()
    }
}

impl<T: Send + 'static> Source<T> {
    /// Emit the first `count` chunks, then close and cancel the upstream.
    pub fn take(self, count: usize) -> Source<T> {
        if count == 0 {
            // Nothing will ever be read; dropping the source cancels it.
            drop(self);
            return crate::create::empty();
        }
        let mut remaining = count;
        apply_fn(self, move |chunk| {
            remaining -= 1;
            Ok(if remaining == 0 {
                Step::Last(chunk)
            } else {
                Step::Emit(chunk)
            })
        })
    }

    /// Emit chunks while `predicate` holds; the first failing chunk is
    /// dropped and the stream closes.
    pub fn take_while<F>(self, mut predicate: F) -> Source<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        apply_fn(self, move |chunk| {
            Ok(if predicate(&chunk) {
                Step::Emit(chunk)
            } else {
                Step::Done
            })
        })
    }

    /// Mirror the stream until `notifier` emits or closes, then close.
    ///
    /// Notifier failures are deliberately ignored: a broken stop signal
    /// must not tear down an otherwise healthy stream.
    pub fn take_until<N: Send + 'static>(self, notifier: Source<N>) -> Source<T> {
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            let stop = CancellationToken::new();
            let finished = CancellationToken::new();
            {
                let stop = stop.clone();
                let finished = finished.clone();
                let mut notifier = notifier.into_reader();
                tokio::spawn(async move {
                    tokio::select! {
                        () = finished.cancelled() => {}
                        outcome = notifier.read() => match outcome {
                            Ok(_) => stop.cancel(),
                            Err(error) => {
                                log::debug!("take_until notifier failed, ignoring: {error}");
                            }
                        },
                    }
                });
            }

            let mut reader = self.into_reader();
            loop {
                tokio::select! {
                    biased;
                    () = stop.cancelled() => {
                        controller.close();
                        reader.cancel();
                        finished.cancel();
                        return Ok(());
                    }
                    readiness = controller.ready() => match readiness {
                        Ok(()) => {}
                        Err(terminated) => {
                            cancel_reader(reader, terminated);
                            finished.cancel();
                            return Ok(());
                        }
                    },
                }
                let outcome = tokio::select! {
                    biased;
                    () = stop.cancelled() => {
                        controller.close();
                        reader.cancel();
                        finished.cancel();
                        return Ok(());
                    }
                    outcome = reader.read() => outcome,
                };
                match outcome {
                    Ok(Some(chunk)) => {
                        if let Err(terminated) = controller.enqueue(chunk) {
                            cancel_reader(reader, terminated);
                            finished.cancel();
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        controller.close();
                        finished.cancel();
                        return Ok(());
                    }
                    Err(error) => {
                        finished.cancel();
                        return Err(error);
                    }
                }
            }
        })
    }

    /// Emit only the first chunk, then close and cancel the upstream.
    pub fn first(self) -> Source<T> {
        self.find(|_| true)
    }

    /// Emit only the first chunk matching `predicate`.
    pub fn find<F>(self, mut predicate: F) -> Source<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        apply_fn(self, move |chunk| {
            Ok(if predicate(&chunk) {
                Step::Last(chunk)
            } else {
                Step::Skip
            })
        })
    }

    /// Emit only the final chunk, once the upstream closes.
    pub fn last(self) -> Source<T> {
        self.find_last(|_| true)
    }

    /// Emit only the last chunk matching `predicate`, once the upstream
    /// closes.
    pub fn find_last<F>(self, predicate: F) -> Source<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        apply(
            self,
            FindLastStage {
                predicate,
                latest: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::{from_iter, timer, timer_with_period};
    use crate::source::Terminated;
    use crate::strategy::QueuingStrategy;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// An endless source that records whether it observed cancellation.
    fn endless(cancelled: Arc<AtomicBool>) -> Source<u64> {
        Source::new(QueuingStrategy::new(1), move |controller| async move {
            let mut n = 0;
            loop {
                match controller.ready().await {
                    Ok(()) => {}
                    Err(Terminated::Cancelled(_)) => {
                        cancelled.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                    Err(Terminated::Closed) => return Ok(()),
                }
                if controller.enqueue(n).is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                n += 1;
            }
        })
    }

    #[tokio::test]
    async fn take_truncates_and_cancels_upstream() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let taken = endless(cancelled.clone()).take(3).to_vec().await.unwrap();
        assert_eq!(taken, vec![0, 1, 2]);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !cancelled.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("upstream must observe cancellation");
    }

    #[tokio::test]
    async fn take_zero_closes_without_reading() {
        assert_eq!(
            from_iter([1, 2]).take(0).to_vec().await.unwrap(),
            Vec::<i32>::new()
        );
    }

    #[tokio::test]
    async fn take_while_stops_at_the_first_failure() {
        let taken = from_iter([1, 2, 5, 3])
            .take_while(|n| *n < 4)
            .to_vec()
            .await
            .unwrap();
        assert_eq!(taken, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn take_until_closes_when_the_notifier_fires() {
        let ticks = timer_with_period(Duration::from_millis(10), Duration::from_millis(10))
            .take_until(timer(Duration::from_millis(35)))
            .to_vec()
            .await
            .unwrap();
        assert_eq!(ticks, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn first_and_find_short_circuit() {
        assert_eq!(from_iter([7, 8, 9]).first().to_vec().await.unwrap(), vec![7]);
        assert_eq!(
            from_iter([7, 8, 9]).find(|n| n % 2 == 0).to_vec().await.unwrap(),
            vec![8]
        );
    }

    #[tokio::test]
    async fn last_and_find_last_wait_for_close() {
        assert_eq!(from_iter([7, 8, 9]).last().to_vec().await.unwrap(), vec![9]);
        assert_eq!(
            from_iter([7, 8, 9])
                .find_last(|n| n % 2 == 1)
                .to_vec()
                .await
                .unwrap(),
            vec![9]
        );
        assert_eq!(
            from_iter(Vec::<i32>::new()).last().to_vec().await.unwrap(),
            Vec::<i32>::new()
        );
    }
}
