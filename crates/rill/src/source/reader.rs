use std::sync::Arc;

use crate::error::StreamError;

use super::{Inner, Terminal};

/// The exclusive consumer handle of a [`Source`](super::Source).
///
/// Reads are serialized by the `&mut` receiver. The first read triggers the
/// source's starter hook, so abandoned readers never start a producer.
/// Dropping a reader mid-stream cancels cooperatively.
pub struct Reader<T> {
    inner: Arc<Inner<T>>,
    done: bool,
}

impl<T> Reader<T> {
    pub(crate) fn new(inner: Arc<Inner<T>>) -> Self {
        Reader { inner, done: false }
    }

    /// Pull the next chunk.
    ///
    /// Resolves with `Ok(Some(chunk))`, `Ok(None)` on a successful close, or
    /// the terminal error. Reading past the end keeps returning the terminal
    /// outcome.
    pub async fn read(&mut self) -> Result<Option<T>, StreamError> {
        loop {
            let wait = self.inner.readable().wait();
            let starter = {
                let mut state = self.inner.state();
                if let Some(chunk) = state.queue.pop_front() {
                    state.reader_parked = false;
                    drop(state);
                    self.inner.writable().signal();
                    return Ok(Some(chunk));
                }
                match &state.terminal {
                    Some(Terminal::Closed) => {
                        self.done = true;
                        return Ok(None);
                    }
                    Some(Terminal::Errored(error)) => {
                        self.done = true;
                        return Err(error.clone());
                    }
                    None => {}
                }
                state.reader_parked = true;
                if state.started {
                    None
                } else {
                    state.started = true;
                    state.starter.take()
                }
            };
            // The parked read is itself a demand signal (high water mark 0
            // streams have no other).
            self.inner.writable().signal();
            if let Some(start) = starter {
                start();
            }
            wait.await;
        }
    }

    /// Cancel the stream, discarding buffered chunks.
    pub fn cancel(self) {
        self.inner.cancel(None);
    }

    /// Cancel with a reason; the reason propagates to the producer and, via
    /// operators, to their upstream sources.
    pub fn cancel_with_reason(self, reason: impl Into<String>) {
        self.inner.cancel(Some(reason.into()));
    }

    pub(crate) fn cancel_opt(self, reason: Option<String>) {
        self.inner.cancel(reason);
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        if !self.done {
            self.inner.cancel(None);
        }
    }
}
