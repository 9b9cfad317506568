//! Drop-while-busy flattening.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::source::{IntoSource, Reader, Source};
use crate::sync::RendezvousQueue;

use super::merge_all::Flow;

struct ExhaustState {
    /// True while an accepted inner is being drained; outer items arriving
    /// in that window are discarded without being projected.
    busy: bool,
    outer_done: bool,
    error: Option<StreamError>,
}

struct ExhaustShared<T> {
    state: Mutex<ExhaustState>,
    queue: RendezvousQueue<Flow<T>>,
    token: CancellationToken,
}

impl<T> ExhaustShared<T> {
    fn state(&self) -> MutexGuard<'_, ExhaustState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latch_error(&self, error: StreamError) {
        let mut state = self.state();
        if state.error.is_none() {
            state.error = Some(error);
        } else {
            log::debug!("exhaust_all swallowing secondary error: {error}");
        }
    }
}

async fn drain_inner<T: Send + 'static>(shared: Arc<ExhaustShared<T>>, mut inner: Reader<T>) {
    loop {
        let outcome = tokio::select! {
            biased;
            () = shared.token.cancelled() => {
                inner.cancel();
                return;
            }
            outcome = inner.read() => outcome,
        };
        match outcome {
            Ok(Some(chunk)) => {
                if shared.queue.push(Flow::Chunk(chunk)).await.is_err() {
                    inner.cancel();
                    return;
                }
            }
            Ok(None) => {
                let finish = {
                    let mut state = shared.state();
                    state.busy = false;
                    state.outer_done
                };
                if finish {
                    let _ = shared.queue.push(Flow::Finish).await;
                }
                return;
            }
            Err(error) => {
                shared.latch_error(error);
                let _ = shared.queue.push(Flow::Finish).await;
                return;
            }
        }
    }
}

async fn read_outer<T, S, P>(shared: Arc<ExhaustShared<S::Item>>, outer: Source<T>, mut project: P)
where
    T: Send + 'static,
    S: IntoSource + Send + 'static,
    P: FnMut(T) -> S + Send + 'static,
{
    let mut outer = outer.into_reader();
    loop {
        let item = tokio::select! {
            biased;
            () = shared.token.cancelled() => {
                outer.cancel();
                return;
            }
            item = outer.read() => item,
        };
        match item {
            Ok(Some(item)) => {
                {
                    let mut state = shared.state();
                    if state.busy {
                        // Drop-while-busy: the item is discarded before
                        // projection.
                        continue;
                    }
                    state.busy = true;
                }
                let inner = project(item).into_source().into_reader();
                tokio::spawn(drain_inner(shared.clone(), inner));
            }
            Ok(None) => {
                let finish = {
                    let mut state = shared.state();
                    state.outer_done = true;
                    !state.busy
                };
                if finish {
                    let _ = shared.queue.push(Flow::Finish).await;
                }
                return;
            }
            Err(error) => {
                shared.latch_error(error);
                let _ = shared.queue.push(Flow::Finish).await;
                return;
            }
        }
    }
}

fn exhaust_core<T, S, P>(outer: Source<T>, project: P) -> Source<S::Item>
where
    T: Send + 'static,
    S: IntoSource + Send + 'static,
    P: FnMut(T) -> S + Send + 'static,
{
    let strategy = outer.strategy();
    Source::new(strategy, move |controller| async move {
        let shared = Arc::new(ExhaustShared {
            state: Mutex::new(ExhaustState {
                busy: false,
                outer_done: false,
                error: None,
            }),
            queue: RendezvousQueue::new(),
            token: CancellationToken::new(),
        });
        tokio::spawn(read_outer::<T, S, P>(shared.clone(), outer, project));

        loop {
            if controller.ready().await.is_err() {
                shared.token.cancel();
                shared.queue.close();
                return Ok(());
            }
            if let Some(error) = shared.state().error.clone() {
                shared.token.cancel();
                shared.queue.close();
                return Err(error);
            }
            let flow = tokio::select! {
                biased;
                _ = controller.closed() => {
                    shared.token.cancel();
                    shared.queue.close();
                    return Ok(());
                }
                flow = shared.queue.pull() => flow,
            };
            match flow {
                Ok(Flow::Chunk(chunk)) => {
                    if controller.enqueue(chunk).is_err() {
                        shared.token.cancel();
                        shared.queue.close();
                        return Ok(());
                    }
                }
                Ok(Flow::Finish) => {
                    let error = shared.state().error.clone();
                    shared.token.cancel();
                    shared.queue.close();
                    return match error {
                        Some(error) => Err(error),
                        None => {
                            controller.close();
                            Ok(())
                        }
                    };
                }
                Err(_) => return Ok(()),
            }
        }
    })
}

impl<S> Source<S>
where
    S: IntoSource + Send + 'static,
{
    /// Flatten a stream of stream-like items, draining one inner at a time
    /// and silently discarding outer items that arrive while an inner is
    /// active. The output completes once the outer stream and the last
    /// started inner have terminated.
    pub fn exhaust_all(self) -> Source<S::Item> {
        exhaust_core::<S, S, _>(self, |item| item)
    }
}

impl<T: Send + 'static> Source<T> {
    /// Project every accepted chunk to a stream-like value under
    /// drop-while-busy admission; discarded chunks are never projected.
    /// See [`exhaust_all`](Source::exhaust_all).
    pub fn exhaust_map<S, P>(self, project: P) -> Source<S::Item>
    where
        S: IntoSource + Send + 'static,
        P: FnMut(T) -> S + Send + 'static,
    {
        exhaust_core::<T, S, P>(self, project)
    }
}

#[cfg(test)]
mod tests {
    use crate::create::from_iter;

    #[tokio::test]
    async fn synchronous_followers_are_discarded() {
        let exhausted = from_iter([1, 2, 3])
            .exhaust_map(|n| vec![n * 10])
            .to_vec()
            .await
            .unwrap();
        assert_eq!(exhausted, vec![10]);
    }

    #[tokio::test]
    async fn projection_never_runs_for_discarded_items() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let projections = Arc::new(AtomicUsize::new(0));
        let exhausted = {
            let projections = projections.clone();
            from_iter([1, 2, 3])
                .exhaust_map(move |n| {
                    projections.fetch_add(1, Ordering::SeqCst);
                    vec![n]
                })
                .to_vec()
                .await
                .unwrap()
        };
        assert_eq!(exhausted, vec![1]);
        assert_eq!(projections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accepts_again_once_the_inner_completes() {
        use crate::create::timer_with_period;
        use std::time::Duration;

        // Ticks at 10ms intervals; each accepted tick opens a 25ms inner,
        // so roughly every third tick is accepted.
        let exhausted = timer_with_period(Duration::from_millis(10), Duration::from_millis(10))
            .take(6)
            .exhaust_map(|n| {
                crate::create::timer(Duration::from_millis(25)).map_sync(move |_| n)
            })
            .to_vec()
            .await
            .unwrap();
        assert!(exhausted.len() >= 2);
        assert_eq!(exhausted[0], 0);
        assert!(exhausted[1] >= 2);
    }
}
