//! Time-based operators.
//!
//! Every timer is owned by the operator's producer task and lives inside a
//! `select!`, so any terminal transition (close, error or cancellation)
//! drops it immediately.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::StreamError;
use crate::source::Source;

use super::forward::cancel_reader;

/// Edge configuration for [`throttle_time`](Source::throttle_time).
///
/// `leading` emits the chunk that opens a throttle window; `trailing` emits
/// the last chunk observed inside a window when the window elapses (or, if
/// the upstream closes mid-window, at the point the window would have
/// elapsed). With both disabled the operator drops everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub leading: bool,
    pub trailing: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            leading: true,
            trailing: false,
        }
    }
}

impl<T: Send + 'static> Source<T> {
    /// Hold every chunk for `duration` before emitting it.
    ///
    /// Chunks are delayed one at a time: the next upstream read only starts
    /// once the previous chunk has been emitted.
    pub fn delay(self, duration: Duration) -> Source<T> {
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
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
                        tokio::select! {
                            biased;
                            terminated = controller.closed() => {
                                cancel_reader(reader, terminated);
                                return Ok(());
                            }
                            () = tokio::time::sleep(duration) => {}
                        }
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
        })
    }

    /// Emit a chunk only once `duration` has passed without a newer one;
    /// each arrival restarts the quiet window and replaces the pending
    /// chunk.
    ///
    /// A chunk pending when the upstream closes is still held for its full
    /// quiet window before being emitted and the stream closed.
    ///
    /// # Panics
    ///
    /// Panics if `duration` is zero: "Debounce duration must be positive".
    pub fn debounce_time(self, duration: Duration) -> Source<T> {
        assert!(
            duration > Duration::ZERO,
            "Debounce duration must be positive"
        );
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            let mut reader = self.into_reader();
            let mut pending: Option<T> = None;
            let mut deadline: Option<Instant> = None;
            let mut upstream_done = false;
            loop {
                let quiet_until = deadline;
                tokio::select! {
                    biased;
                    terminated = controller.closed() => {
                        cancel_reader(reader, terminated);
                        return Ok(());
                    }
                    () = async {
                        match quiet_until {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        deadline = None;
                        if let Some(chunk) = pending.take() {
                            match controller.ready().await {
                                Ok(()) => {}
                                Err(terminated) => {
                                    cancel_reader(reader, terminated);
                                    return Ok(());
                                }
                            }
                            if let Err(terminated) = controller.enqueue(chunk) {
                                cancel_reader(reader, terminated);
                                return Ok(());
                            }
                        }
                        if upstream_done {
                            controller.close();
                            return Ok(());
                        }
                    }
                    outcome = reader.read(), if !upstream_done => match outcome {
                        Ok(Some(chunk)) => {
                            pending = Some(chunk);
                            deadline = Some(Instant::now() + duration);
                        }
                        Ok(None) => {
                            upstream_done = true;
                            if pending.is_none() {
                                controller.close();
                                return Ok(());
                            }
                        }
                        Err(error) => return Err(error),
                    },
                }
            }
        })
    }

    /// Rate-limit the stream to one window of `duration` per emission; see
    /// [`ThrottleConfig`] for edge behavior.
    pub fn throttle_time(self, duration: Duration, config: ThrottleConfig) -> Source<T> {
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            let mut reader = self.into_reader();
            let mut pending: Option<T> = None;
            let mut window_end: Option<Instant> = None;
            let mut upstream_done = false;
            loop {
                let trailing_at = if pending.is_some() { window_end } else { None };
                tokio::select! {
                    biased;
                    terminated = controller.closed() => {
                        cancel_reader(reader, terminated);
                        return Ok(());
                    }
                    () = async {
                        match trailing_at {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        if let Some(chunk) = pending.take() {
                            match controller.ready().await {
                                Ok(()) => {}
                                Err(terminated) => {
                                    cancel_reader(reader, terminated);
                                    return Ok(());
                                }
                            }
                            if let Err(terminated) = controller.enqueue(chunk) {
                                cancel_reader(reader, terminated);
                                return Ok(());
                            }
                            // A trailing emission opens a fresh window.
                            window_end = Some(Instant::now() + duration);
                        }
                        if upstream_done {
                            controller.close();
                            return Ok(());
                        }
                    }
                    outcome = reader.read(), if !upstream_done => match outcome {
                        Ok(Some(chunk)) => {
                            let now = Instant::now();
                            let in_window = window_end.is_some_and(|end| now < end);
                            if in_window {
                                if config.trailing {
                                    pending = Some(chunk);
                                }
                            } else {
                                window_end = Some(now + duration);
                                if config.leading {
                                    match controller.ready().await {
                                        Ok(()) => {}
                                        Err(terminated) => {
                                            cancel_reader(reader, terminated);
                                            return Ok(());
                                        }
                                    }
                                    if let Err(terminated) = controller.enqueue(chunk) {
                                        cancel_reader(reader, terminated);
                                        return Ok(());
                                    }
                                } else if config.trailing {
                                    pending = Some(chunk);
                                }
                            }
                        }
                        Ok(None) => {
                            upstream_done = true;
                            if pending.is_none() {
                                controller.close();
                                return Ok(());
                            }
                        }
                        Err(error) => return Err(error),
                    },
                }
            }
        })
    }

    /// Fail with [`StreamError::Timeout`] if no chunk arrives within
    /// `duration` of the previous one. The window is measured while the
    /// downstream is ready to receive; waiting for demand does not count.
    /// On timeout the upstream is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if `duration` is zero: "Timeout duration must be positive".
    pub fn timeout(self, duration: Duration) -> Source<T> {
        assert!(
            duration > Duration::ZERO,
            "Timeout duration must be positive"
        );
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            let mut reader = self.into_reader();
            loop {
                match controller.ready().await {
                    Ok(()) => {}
                    Err(terminated) => {
                        cancel_reader(reader, terminated);
                        return Ok(());
                    }
                }
                let deadline = Instant::now() + duration;
                tokio::select! {
                    biased;
                    terminated = controller.closed() => {
                        cancel_reader(reader, terminated);
                        return Ok(());
                    }
                    outcome = reader.read() => match outcome {
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
                    },
                    () = tokio::time::sleep_until(deadline) => {
                        let error = StreamError::Timeout(duration.as_millis());
                        reader.cancel_with_reason(error.to_string());
                        return Err(error);
                    }
                }
            }
        })
    }
}
