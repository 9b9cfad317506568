//! Terminal consumers: drain a [`Source`] into a value or hand it to a
//! callback-driven subscription.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};
use crate::source::Source;

impl<T: Send + 'static> Source<T> {
    /// Drain the source into a `Vec`, re-throwing the terminal error.
    pub async fn to_vec(self) -> Result<Vec<T>> {
        let mut reader = self.into_reader();
        let mut items = Vec::new();
        loop {
            match reader.read().await? {
                Some(chunk) => items.push(chunk),
                None => return Ok(items),
            }
        }
    }

    /// Drain the source and resolve with its final chunk, or `None` if the
    /// source closed without emitting.
    pub async fn last_value(self) -> Result<Option<T>> {
        let mut reader = self.into_reader();
        let mut last = None;
        loop {
            match reader.read().await? {
                Some(chunk) => last = Some(chunk),
                None => return Ok(last),
            }
        }
    }

    /// Feed every chunk to `on_next` on a dedicated task.
    ///
    /// The returned [`Subscription`] cancels the source cooperatively on
    /// [`unsubscribe`](Subscription::unsubscribe); dropping it leaves the
    /// subscription running detached.
    pub fn subscribe<F>(self, mut on_next: F) -> Subscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move {
                let mut reader = self.into_reader();
                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            reader.cancel_with_reason("unsubscribed");
                            return Ok(());
                        }
                        chunk = reader.read() => match chunk? {
                            Some(value) => on_next(value),
                            None => return Ok(()),
                        },
                    }
                }
            })
        };
        Subscription { token, handle }
    }
}

impl Source<String> {
    /// Concatenate every chunk of a string stream.
    pub async fn to_text(self) -> Result<String> {
        let mut reader = self.into_reader();
        let mut text = String::new();
        loop {
            match reader.read().await? {
                Some(chunk) => text.push_str(&chunk),
                None => return Ok(text),
            }
        }
    }
}

/// Handle to a running [`subscribe`](Source::subscribe) loop.
pub struct Subscription {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Subscription {
    /// Stop the subscription; the source is cancelled with reason
    /// `"unsubscribed"`.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    /// Wait for the subscription to finish and surface the stream's
    /// terminal outcome. Cancellation is not an error.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(StreamError::msg(format!(
                "subscriber task failed: {join_error}"
            ))),
        }
    }
}
