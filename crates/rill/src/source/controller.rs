use std::sync::Arc;

use crate::error::StreamError;

use super::{Inner, Terminal};

/// Why a producer can no longer emit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminated {
    /// The stream already closed or errored.
    Closed,
    /// The consumer cancelled, with the reason it supplied.
    Cancelled(Option<String>),
}

/// The emission surface of a stream being produced.
///
/// Cloneable so that cooperating producer tasks (splitter coordinators,
/// racing readers) can share one output. Terminal transitions are
/// exactly-once: after [`close`](Controller::close) or
/// [`error`](Controller::error) every further emission attempt fails
/// silently, which is exactly what a late async producer needs during
/// cleanup.
pub struct Controller<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Controller {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Controller<T> {
    pub(crate) fn new(inner: Arc<Inner<T>>) -> Self {
        Controller { inner }
    }

    /// How many chunks the downstream currently wants.
    ///
    /// Positive means "emit more", zero or negative means "pause", `None`
    /// means the stream is terminal and emission is over. This is the sole
    /// backpressure signal.
    pub fn desired_size(&self) -> Option<i64> {
        let state = self.inner.state();
        if state.terminal.is_some() {
            return None;
        }
        Some(state.high_water_mark as i64 - state.queue.len() as i64)
    }

    /// Whether a read is currently parked on an empty buffer. Relevant for
    /// zero-high-water-mark streams, where `desired_size` never goes
    /// positive and a parked read is the only demand signal.
    pub fn has_parked_reader(&self) -> bool {
        self.inner.state().reader_parked
    }

    /// The terminal state, if any.
    pub fn termination(&self) -> Option<Terminated> {
        let state = self.inner.state();
        if state.cancelled {
            Some(Terminated::Cancelled(state.cancel_reason.clone()))
        } else if state.terminal.is_some() {
            Some(Terminated::Closed)
        } else {
            None
        }
    }

    /// Deliver a chunk.
    ///
    /// Fails (returning the chunkless terminal state) once the stream is
    /// closed, errored or cancelled; producers treat that as the signal to
    /// stop and unwind.
    pub fn enqueue(&self, chunk: T) -> Result<(), Terminated> {
        {
            let mut state = self.inner.state();
            if state.cancelled {
                return Err(Terminated::Cancelled(state.cancel_reason.clone()));
            }
            if state.terminal.is_some() {
                return Err(Terminated::Closed);
            }
            state.queue.push_back(chunk);
        }
        self.inner.readable().signal();
        Ok(())
    }

    /// Terminal success. Buffered chunks still drain; later calls are
    /// swallowed.
    pub fn close(&self) {
        {
            let mut state = self.inner.state();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(Terminal::Closed);
        }
        self.inner.readable().signal();
        self.inner.writable().signal();
    }

    /// Terminal failure. Buffered chunks are discarded so the consumer
    /// observes the error immediately; later calls are swallowed.
    pub fn error(&self, error: StreamError) {
        {
            let mut state = self.inner.state();
            if state.terminal.is_some() {
                log::debug!("discarding error after terminal event: {error}");
                return;
            }
            state.queue.clear();
            state.terminal = Some(Terminal::Errored(error));
        }
        self.inner.readable().signal();
        self.inner.writable().signal();
    }

    /// Park until the downstream wants a chunk.
    ///
    /// Resolves once `desired_size` is positive or a read is parked on the
    /// stream; fails with the terminal state if the stream closed, errored
    /// or was cancelled in the meantime. Producer loops await this before
    /// every upstream read so that no chunk is ever produced against
    /// observed saturation.
    pub async fn ready(&self) -> Result<(), Terminated> {
        loop {
            let wait = self.inner.writable().wait();
            {
                let state = self.inner.state();
                if state.cancelled {
                    return Err(Terminated::Cancelled(state.cancel_reason.clone()));
                }
                if state.terminal.is_some() {
                    return Err(Terminated::Closed);
                }
                let desired = state.high_water_mark as i64 - state.queue.len() as i64;
                if desired > 0 || state.reader_parked {
                    return Ok(());
                }
            }
            wait.await;
        }
    }

    /// Park until the stream terminates. Select against this in
    /// timer-driven producers so a cancellation interrupts the wait.
    pub async fn closed(&self) -> Terminated {
        loop {
            let wait = self.inner.writable().wait();
            if let Some(terminated) = self.termination() {
                return terminated;
            }
            wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use crate::strategy::QueuingStrategy;

    fn idle<T: Send + 'static>(high_water_mark: usize) -> (Source<T>, Controller<T>) {
        Source::with_controller(QueuingStrategy::new(high_water_mark), |_| {})
    }

    #[tokio::test]
    async fn desired_size_tracks_the_queue() {
        let (_source, controller) = idle(2);
        assert_eq!(controller.desired_size(), Some(2));
        controller.enqueue(1).unwrap();
        assert_eq!(controller.desired_size(), Some(1));
        controller.enqueue(2).unwrap();
        assert_eq!(controller.desired_size(), Some(0));
        // Enqueue beyond the mark is allowed and drives the size negative.
        controller.enqueue(3).unwrap();
        assert_eq!(controller.desired_size(), Some(-1));
    }

    #[tokio::test]
    async fn terminal_stream_reports_no_desired_size() {
        let (_source, controller) = idle::<u32>(4);
        controller.close();
        assert_eq!(controller.desired_size(), None);
    }

    #[tokio::test]
    async fn emission_fails_after_close() {
        let (_source, controller) = idle(4);
        controller.enqueue(1).unwrap();
        controller.close();
        assert_eq!(controller.enqueue(2), Err(Terminated::Closed));
        // A second terminal transition is swallowed, not an error.
        controller.close();
        controller.error(StreamError::msg("late"));
    }

    #[tokio::test]
    async fn cancellation_carries_the_reason() {
        let (source, controller) = idle::<u32>(4);
        source.into_reader().cancel_with_reason("enough");
        assert_eq!(
            controller.termination(),
            Some(Terminated::Cancelled(Some("enough".into())))
        );
        assert_eq!(
            controller.enqueue(1),
            Err(Terminated::Cancelled(Some("enough".into())))
        );
        assert_eq!(
            controller.ready().await,
            Err(Terminated::Cancelled(Some("enough".into())))
        );
    }

    #[tokio::test]
    async fn ready_resolves_once_demand_opens() {
        let (source, controller) = idle(1);
        controller.enqueue(1).unwrap();
        assert_eq!(controller.desired_size(), Some(0));

        let mut reader = source.into_reader();
        let (chunk, readiness) = tokio::join!(reader.read(), controller.ready());
        assert_eq!(chunk.unwrap(), Some(1));
        assert_eq!(readiness, Ok(()));
    }
}
