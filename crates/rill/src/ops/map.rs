//! Chunk-wise transformation operators.

use std::future::Future;

use crate::source::Source;

use super::forward::{apply_fn, cancel_reader, Step};

impl<T: Send + 'static> Source<T> {
    /// Transform every chunk through an async function.
    ///
    /// The transform runs one chunk at a time; its await points are
    /// cancellation checkpoints, so a consumer cancelling mid-transform
    /// drops the result instead of emitting it.
    pub fn map<U, F, Fut>(self, transform: F) -> Source<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            let mut transform = transform;
            let mut reader = self.into_reader();
            loop {
                match controller.ready().await {
                    Ok(()) => {}
                    Err(terminated) => {
                        cancel_reader(reader, terminated);
                        return Ok(());
                    }
                }
                match reader.read().await {
                    Ok(Some(chunk)) => {
                        let value = transform(chunk).await;
                        if let Err(terminated) = controller.enqueue(value) {
                            cancel_reader(reader, terminated);
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        controller.close();
                        return Ok(());
                    }
                    Err(error) => return Err(error),
                }
            }
        })
    }

    /// Transform every chunk through a synchronous function.
    pub fn map_sync<U, F>(self, mut transform: F) -> Source<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        apply_fn(self, move |chunk| Ok(Step::Emit(transform(chunk))))
    }

    /// Keep only the chunks matching `predicate`.
    pub fn filter<F>(self, mut predicate: F) -> Source<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        apply_fn(self, move |chunk| {
            Ok(if predicate(&chunk) {
                Step::Emit(chunk)
            } else {
                Step::Skip
            })
        })
    }

    /// Transform and filter in one pass: `None` results are dropped.
    pub fn filter_map<U, F>(self, mut transform: F) -> Source<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        apply_fn(self, move |chunk| {
            Ok(match transform(chunk) {
                Some(value) => Step::Emit(value),
                None => Step::Skip,
            })
        })
    }

    /// Observe every chunk without altering the stream.
    pub fn tap<F>(self, mut observe: F) -> Source<T>
    where
        F: FnMut(&T) + Send + 'static,
    {
        apply_fn(self, move |chunk| {
            observe(&chunk);
            Ok(Step::Emit(chunk))
        })
    }

    /// Emit the running accumulation of `fold` over the stream, starting
    /// from `seed`. The seed itself is not emitted.
    pub fn scan<A, F>(self, seed: A, mut fold: F) -> Source<A>
    where
        A: Clone + Send + 'static,
        F: FnMut(A, T) -> A + Send + 'static,
    {
        let mut accumulator = seed;
        apply_fn(self, move |chunk| {
            accumulator = fold(accumulator.clone(), chunk);
            Ok(Step::Emit(accumulator.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::create::from_iter;

    #[tokio::test]
    async fn map_transforms_asynchronously() {
        let doubled = from_iter([1, 2, 3])
            .map(|n| async move {
                tokio::task::yield_now().await;
                n * 2
            })
            .to_vec()
            .await
            .unwrap();
        assert_eq!(doubled, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn map_sync_matches_iterator_map() {
        let squared = from_iter([1, 2, 3]).map_sync(|n| n * n).to_vec().await;
        assert_eq!(squared.unwrap(), vec![1, 4, 9]);
    }

    #[tokio::test]
    async fn filter_drops_non_matching_chunks() {
        let even = from_iter(1..=6).filter(|n| n % 2 == 0).to_vec().await;
        assert_eq!(even.unwrap(), vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn filter_map_drops_none_results() {
        let parsed = from_iter(vec!["1", "x", "3"])
            .filter_map(|s| s.parse::<i32>().ok())
            .to_vec()
            .await
            .unwrap();
        assert_eq!(parsed, vec![1, 3]);
    }

    #[tokio::test]
    async fn tap_observes_without_changing_the_stream() {
        use std::sync::atomic::{AtomicI64, Ordering};
        use std::sync::Arc;

        let sum = Arc::new(AtomicI64::new(0));
        let passed = {
            let sum = sum.clone();
            from_iter([1i64, 2, 3])
                .tap(move |n| {
                    sum.fetch_add(*n, Ordering::SeqCst);
                })
                .to_vec()
                .await
                .unwrap()
        };
        assert_eq!(passed, vec![1, 2, 3]);
        assert_eq!(sum.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn scan_emits_each_accumulation() {
        let sums = from_iter([1, 2, 3, 4])
            .scan(0, |acc, n| acc + n)
            .to_vec()
            .await
            .unwrap();
        assert_eq!(sums, vec![1, 3, 6, 10]);
    }
}
