//! Operators that reshape a stream around its lifetime: deduplication,
//! batching, counting, prefixing and emptiness defaults.

use std::collections::HashSet;
use std::hash::Hash;
use std::mem;

use crate::error::StreamError;
use crate::source::Source;

use super::forward::{apply, apply_fn, cancel_reader, pump, Stage, Step};

struct CountStage {
    count: usize,
}

impl<T: Send + 'static> Stage<T, usize> for CountStage {
    fn on_chunk(&mut self, _chunk: T) -> Result<Step<usize>, StreamError> {
        self.count += 1;
        Ok(Step::Skip)
    }

    fn on_close(&mut self) -> Option<usize> {
        Some(self.count)
    }
}

struct BufferStage<T> {
    capacity: usize,
    buffered: Vec<T>,
}

impl<T: Send + 'static> Stage<T, Vec<T>> for BufferStage<T> {
    fn on_chunk(&mut self, chunk: T) -> Result<Step<Vec<T>>, StreamError> {
        self.buffered.push(chunk);
        if self.buffered.len() == self.capacity {
            Ok(Step::Emit(mem::take(&mut self.buffered)))
        } else {
            Ok(Step::Skip)
        }
    }

    fn on_close(&mut self) -> Option<Vec<T>> {
        if self.buffered.is_empty() {
            None
        } else {
            Some(mem::take(&mut self.buffered))
        }
    }
}

struct DefaultIfEmptyStage<T> {
    default: Option<T>,
}

impl<T: Send + 'static> Stage<T, T> for DefaultIfEmptyStage<T> {
    fn on_chunk(&mut self, chunk: T) -> Result<Step<T>, StreamError> {
        self.default = None;
        Ok(Step::Emit(chunk))
    }

    fn on_close(&mut self) -> Option<T> {
        self.default.take()
    }
}

impl<T: Send + 'static> Source<T> {
    /// Emit the number of chunks once the stream closes.
    pub fn count(self) -> Source<usize> {
        apply(self, CountStage { count: 0 })
    }

    /// Collect chunks into batches of `size`; a final partial batch is
    /// emitted on close.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero: "Buffer count must be greater than 0".
    pub fn buffer(self, size: usize) -> Source<Vec<T>> {
        assert!(size > 0, "Buffer count must be greater than 0");
        apply(
            self,
            BufferStage {
                capacity: size,
                buffered: Vec::new(),
            },
        )
    }

    /// Emit `default` if the stream closes without having emitted anything.
    pub fn default_if_empty(self, default: T) -> Source<T> {
        apply(
            self,
            DefaultIfEmptyStage {
                default: Some(default),
            },
        )
    }

    /// Drop every chunk, keeping only the terminal event.
    pub fn ignore_elements(self) -> Source<T> {
        apply_fn(self, |_chunk| Ok(Step::Skip))
    }

    /// Emit `values` before the chunks of the stream itself.
    pub fn start_with<I>(self, values: I) -> Source<T>
    where
        I: IntoIterator<Item = T> + Send + 'static,
        I::IntoIter: Send,
    {
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            for value in values {
                if controller.ready().await.is_err() {
                    return Ok(());
                }
                if let Err(terminated) = controller.enqueue(value) {
                    cancel_reader(self.into_reader(), terminated);
                    return Ok(());
                }
            }
            pump(&controller, self.into_reader()).await
        })
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Source<T> {
    /// Emit only chunks never seen before.
    pub fn distinct(self) -> Source<T> {
        let mut seen = HashSet::new();
        apply_fn(self, move |chunk: T| {
            Ok(if seen.insert(chunk.clone()) {
                Step::Emit(chunk)
            } else {
                Step::Skip
            })
        })
    }
}

impl<T: Clone + PartialEq + Send + 'static> Source<T> {
    /// Drop chunks equal to their immediate predecessor.
    pub fn distinct_until_changed(self) -> Source<T> {
        let mut previous: Option<T> = None;
        apply_fn(self, move |chunk: T| {
            if previous.as_ref() == Some(&chunk) {
                Ok(Step::Skip)
            } else {
                previous = Some(chunk.clone());
                Ok(Step::Emit(chunk))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::create::{empty, from_iter};

    #[tokio::test]
    async fn count_reports_the_chunk_total() {
        assert_eq!(from_iter(0..5).count().to_vec().await.unwrap(), vec![5]);
        assert_eq!(empty::<u8>().count().to_vec().await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn buffer_batches_and_flushes_the_remainder() {
        let batches = from_iter([1, 2, 3, 4, 5]).buffer(2).to_vec().await;
        assert_eq!(batches.unwrap(), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    #[should_panic(expected = "Buffer count must be greater than 0")]
    fn buffer_rejects_a_zero_count() {
        let _ = from_iter([1]).buffer(0);
    }

    #[tokio::test]
    async fn default_if_empty_only_fires_on_empty_streams() {
        assert_eq!(
            empty::<i32>().default_if_empty(9).to_vec().await.unwrap(),
            vec![9]
        );
        assert_eq!(
            from_iter([1, 2]).default_if_empty(9).to_vec().await.unwrap(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn ignore_elements_keeps_only_completion() {
        assert_eq!(
            from_iter([1, 2, 3]).ignore_elements().to_vec().await.unwrap(),
            Vec::<i32>::new()
        );
    }

    #[tokio::test]
    async fn start_with_prefixes_the_stream() {
        assert_eq!(
            from_iter([3, 4]).start_with([1, 2]).to_vec().await.unwrap(),
            vec![1, 2, 3, 4]
        );
    }

    #[tokio::test]
    async fn distinct_drops_repeats_anywhere() {
        assert_eq!(
            from_iter([1, 2, 1, 3, 2]).distinct().to_vec().await.unwrap(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn distinct_until_changed_drops_adjacent_repeats() {
        assert_eq!(
            from_iter([1, 1, 2, 2, 1])
                .distinct_until_changed()
                .to_vec()
                .await
                .unwrap(),
            vec![1, 2, 1]
        );
    }
}
