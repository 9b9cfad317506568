//! Bounded-concurrency flattening.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::source::{IntoSource, Reader, Source};
use crate::sync::{Gate, RendezvousQueue};

pub(crate) enum Flow<T> {
    Chunk(T),
    Finish,
}

struct MergeState {
    reading: usize,
    outer_done: bool,
    error: Option<StreamError>,
}

struct MergeShared<T> {
    state: Mutex<MergeState>,
    queue: RendezvousQueue<Flow<T>>,
    gate: Gate,
    token: CancellationToken,
}

impl<T> MergeShared<T> {
    fn state(&self) -> MutexGuard<'_, MergeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latch the first error; later ones are swallowed.
    fn latch_error(&self, error: StreamError) {
        let mut state = self.state();
        if state.error.is_none() {
            state.error = Some(error);
        } else {
            log::debug!("merge_all swallowing secondary error: {error}");
        }
    }
}

async fn drain_inner<T: Send + 'static>(shared: Arc<MergeShared<T>>, mut inner: Reader<T>) {
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
                    state.reading -= 1;
                    state.outer_done && state.reading == 0
                };
                shared.gate.release();
                if finish {
                    let _ = shared.queue.push(Flow::Finish).await;
                }
                return;
            }
            Err(error) => {
                shared.latch_error(error);
                shared.state().reading -= 1;
                shared.gate.release();
                let _ = shared.queue.push(Flow::Finish).await;
                return;
            }
        }
    }
}

async fn read_outer<T, S, P>(shared: Arc<MergeShared<S::Item>>, outer: Source<T>, mut project: P)
where
    T: Send + 'static,
    S: IntoSource + Send + 'static,
    P: FnMut(T) -> S + Send + 'static,
{
    let mut outer = outer.into_reader();
    loop {
        // The gate bounds concurrency: the next outer item is only read
        // once a slot frees up.
        tokio::select! {
            biased;
            () = shared.token.cancelled() => {
                outer.cancel();
                return;
            }
            () = shared.gate.acquire() => {}
        }
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
                let inner = project(item).into_source().into_reader();
                shared.state().reading += 1;
                tokio::spawn(drain_inner(shared.clone(), inner));
            }
            Ok(None) => {
                let finish = {
                    let mut state = shared.state();
                    state.outer_done = true;
                    state.reading == 0
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

pub(crate) fn merge_core<T, S, P>(
    outer: Source<T>,
    concurrency: usize,
    project: P,
) -> Source<S::Item>
where
    T: Send + 'static,
    S: IntoSource + Send + 'static,
    P: FnMut(T) -> S + Send + 'static,
{
    assert!(
        concurrency > 0,
        "Concurrency limit must be greater than zero"
    );
    let strategy = outer.strategy();
    Source::new(strategy, move |controller| async move {
        let shared = Arc::new(MergeShared {
            state: Mutex::new(MergeState {
                reading: 0,
                outer_done: false,
                error: None,
            }),
            queue: RendezvousQueue::new(),
            gate: Gate::new(concurrency),
            token: CancellationToken::new(),
        });
        tokio::spawn(read_outer::<T, S, P>(shared.clone(), outer, project));

        // The single downstream emission loop: chunks from every inner
        // funnel through the rendezvous queue, so producers inherit this
        // loop's pace.
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
    /// Flatten a stream of stream-like items, draining up to `concurrency`
    /// inners at a time and interleaving their chunks as they arrive.
    ///
    /// The output completes only once the outer stream and every started
    /// inner have terminated. Pass `usize::MAX` for unbounded concurrency.
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` is zero: "Concurrency limit must be greater
    /// than zero".
    pub fn merge_all(self, concurrency: usize) -> Source<S::Item> {
        merge_core::<S, S, _>(self, concurrency, |item| item)
    }
}

impl<T: Send + 'static> Source<T> {
    /// Project every chunk to a stream-like value and merge the results
    /// with bounded concurrency; see
    /// [`merge_all`](Source::merge_all).
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` is zero: "Concurrency limit must be greater
    /// than zero".
    pub fn merge_map<S, P>(self, project: P, concurrency: usize) -> Source<S::Item>
    where
        S: IntoSource + Send + 'static,
        P: FnMut(T) -> S + Send + 'static,
    {
        merge_core::<T, S, P>(self, concurrency, project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create::from_iter;
    use crate::strategy::QueuingStrategy;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn merges_every_inner_chunk() {
        let merged = from_iter(vec![vec![1, 2], vec![3], vec![], vec![4, 5]])
            .merge_all(usize::MAX)
            .to_vec()
            .await
            .unwrap();
        assert_eq!(merged.len(), 5);
        assert_eq!(merged.iter().collect::<HashSet<_>>().len(), 5);
    }

    #[tokio::test]
    async fn per_inner_order_is_preserved() {
        let merged = from_iter(vec![vec![1, 2, 3], vec![10, 20, 30]])
            .merge_all(usize::MAX)
            .to_vec()
            .await
            .unwrap();
        let small: Vec<_> = merged.iter().filter(|n| **n < 10).collect();
        let large: Vec<_> = merged.iter().filter(|n| **n >= 10).collect();
        assert_eq!(small, vec![&1, &2, &3]);
        assert_eq!(large, vec![&10, &20, &30]);
    }

    #[tokio::test]
    async fn concurrency_limit_bounds_active_inners() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let inners: Vec<Source<u32>> = (0..6)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                Source::new(QueuingStrategy::new(1), move |controller| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    for n in 0..3u32 {
                        if controller.ready().await.is_err() {
                            break;
                        }
                        if controller.enqueue(n).is_err() {
                            break;
                        }
                    }
                    active.fetch_sub(1, Ordering::SeqCst);
                    controller.close();
                    Ok(())
                })
            })
            .collect();

        let merged = from_iter(inners).merge_all(2).to_vec().await.unwrap();
        assert_eq!(merged.len(), 18);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn completes_only_after_outer_and_inners() {
        let merged = from_iter(vec![vec![1], vec![2]])
            .merge_all(1)
            .to_vec()
            .await
            .unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[tokio::test]
    async fn first_error_wins() {
        use crate::create::throw_error;

        let sources = vec![
            from_iter(vec![1]),
            throw_error(StreamError::msg("inner failure")),
        ];
        let error = from_iter(sources)
            .merge_all(usize::MAX)
            .to_vec()
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "inner failure");
    }

    #[tokio::test]
    async fn merge_map_projects_then_merges() {
        let merged = from_iter([1, 2, 3])
            .merge_map(|n| vec![n * 10], usize::MAX)
            .to_vec()
            .await
            .unwrap();
        let expected: HashSet<i32> = [10, 20, 30].into();
        assert_eq!(merged.into_iter().collect::<HashSet<_>>(), expected);
    }

    #[test]
    #[should_panic(expected = "Concurrency limit must be greater than zero")]
    fn zero_concurrency_is_rejected() {
        let _ = from_iter(vec![vec![1]]).merge_all(0);
    }
}
