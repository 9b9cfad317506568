//! The producer loop shared by every single-source operator.
//!
//! Each operator wraps its upstream in a fresh downstream source whose
//! producer runs this loop: wait for downstream demand, read one upstream
//! chunk, feed it through the operator's [`Stage`], emit whatever comes out.
//! Errors terminate the downstream and cancel the upstream once;
//! cancellation propagates upstream with the consumer's reason; upstream
//! end closes the downstream after the stage's final flush.

use crate::error::StreamError;
use crate::source::{Controller, Reader, Source, Terminated};

/// What a stage wants done with the chunk it was handed.
pub(crate) enum Step<U> {
    /// Emit a value downstream.
    Emit(U),
    /// Emit nothing for this chunk.
    Skip,
    /// Emit a final value, then close and cancel the upstream.
    Last(U),
    /// Close immediately and cancel the upstream; the chunk is dropped.
    Done,
}

/// Per-chunk operator logic.
///
/// Stateless-per-chunk operators wrap a closure in [`ChunkFn`]; operators
/// that must flush on upstream close (`count`, `last`, `buffer`, ...)
/// implement the trait on a small state struct instead.
pub(crate) trait Stage<T, U>: Send + 'static {
    fn on_chunk(&mut self, chunk: T) -> Result<Step<U>, StreamError>;

    /// Final value to emit when the upstream closes.
    fn on_close(&mut self) -> Option<U> {
        None
    }
}

/// Adapter turning a per-chunk closure into a [`Stage`].
pub(crate) struct ChunkFn<F>(F);

impl<T, U, F> Stage<T, U> for ChunkFn<F>
where
    F: FnMut(T) -> Result<Step<U>, StreamError> + Send + 'static,
{
    fn on_chunk(&mut self, chunk: T) -> Result<Step<U>, StreamError> {
        (self.0)(chunk)
    }
}

/// [`apply`] for operators whose whole logic fits in a per-chunk closure.
pub(crate) fn apply_fn<T, U, F>(source: Source<T>, on_chunk: F) -> Source<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Result<Step<U>, StreamError> + Send + 'static,
{
    apply(source, ChunkFn(on_chunk))
}

/// Cancel an upstream reader for a downstream terminal state, forwarding
/// the consumer's reason when there is one.
pub(crate) fn cancel_reader<T>(reader: Reader<T>, terminated: Terminated) {
    match terminated {
        Terminated::Cancelled(reason) => reader.cancel_opt(reason),
        Terminated::Closed => reader.cancel(),
    }
}

/// Apply `stage` to `source`, producing the operator's output.
pub(crate) fn apply<T, U, S>(source: Source<T>, stage: S) -> Source<U>
where
    T: Send + 'static,
    U: Send + 'static,
    S: Stage<T, U>,
{
    let strategy = source.strategy();
    Source::new(strategy, move |controller| async move {
        let mut stage = stage;
        let mut reader = source.into_reader();
        loop {
            match controller.ready().await {
                Ok(()) => {}
                Err(terminated) => {
                    cancel_reader(reader, terminated);
                    return Ok(());
                }
            }
            match reader.read().await {
                Ok(Some(chunk)) => match stage.on_chunk(chunk) {
                    Ok(Step::Emit(value)) => {
                        if let Err(terminated) = controller.enqueue(value) {
                            cancel_reader(reader, terminated);
                            return Ok(());
                        }
                    }
                    Ok(Step::Skip) => {}
                    Ok(Step::Last(value)) => {
                        let _ = controller.enqueue(value);
                        controller.close();
                        reader.cancel();
                        return Ok(());
                    }
                    Ok(Step::Done) => {
                        controller.close();
                        reader.cancel();
                        return Ok(());
                    }
                    Err(error) => {
                        reader.cancel_with_reason(error.to_string());
                        return Err(error);
                    }
                },
                Ok(None) => {
                    if let Some(value) = stage.on_close() {
                        let _ = controller.enqueue(value);
                    }
                    controller.close();
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }
    })
}

/// Forward a reader to a controller unchanged: the identity producer loop.
/// Used wherever an operator adopts an already-open reader (`defer`, `race`
/// winners, `catch_error` fallbacks).
pub(crate) async fn pump<T: Send + 'static>(
    controller: &Controller<T>,
    reader: Reader<T>,
) -> Result<(), StreamError> {
    let mut reader = reader;
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
                if let Err(terminated) = controller.enqueue(chunk) {
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
}
