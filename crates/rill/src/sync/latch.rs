use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Single-shot wait/notify.
///
/// [`Latch::wait`] registers interest immediately and resolves on the next
/// [`Latch::signal`]. Every waiter registered at signal time is woken once;
/// waiters that register during or after a signal wait for the next one.
///
/// The eager registration matters: callers typically create the wait future,
/// then inspect shared state under a lock, then await. A signal fired between
/// the inspection and the await is not lost.
#[derive(Debug, Default)]
pub struct Latch {
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Latch::default()
    }

    /// Returns a future resolved by the next [`signal`](Latch::signal).
    pub fn wait(&self) -> Wait<'_> {
        let mut notified = Box::pin(self.notify.notified());
        notified.as_mut().enable();
        Wait { notified }
    }

    /// Wake every currently registered waiter.
    pub fn signal(&self) {
        self.notify.notify_waiters();
    }
}

/// Future returned by [`Latch::wait`].
pub struct Wait<'a> {
    notified: Pin<Box<Notified<'a>>>,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.notified.as_mut().poll(cx)
    }
}
