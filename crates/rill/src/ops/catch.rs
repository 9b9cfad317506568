//! Error recovery.

use crate::error::StreamError;
use crate::source::{IntoSource, Source};

use super::forward::{cancel_reader, pump};

impl<T: Send + 'static> Source<T> {
    /// On upstream failure, switch to the source built by `selector`.
    ///
    /// The selector runs once, with the error that terminated the upstream.
    /// Failures of the fallback itself are terminal.
    pub fn catch_error<S, F>(self, selector: F) -> Source<T>
    where
        S: IntoSource<Item = T> + Send + 'static,
        F: FnOnce(StreamError) -> S + Send + 'static,
    {
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
                        if let Err(terminated) = controller.enqueue(chunk) {
                            cancel_reader(reader, terminated);
                            return Ok(());
                        }
                    }
                    Ok(None) => {
                        controller.close();
                        return Ok(());
                    }
                    Err(error) => {
                        log::debug!("catch_error switching to fallback after: {error}");
                        let fallback = selector(error).into_source().into_reader();
                        return pump(&controller, fallback).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::create::{from_iter, throw_error};
    use crate::error::StreamError;

    #[tokio::test]
    async fn errors_switch_to_the_fallback() {
        let recovered = throw_error::<i32>(StreamError::msg("broken"))
            .catch_error(|_| vec![7, 8])
            .to_vec()
            .await
            .unwrap();
        assert_eq!(recovered, vec![7, 8]);
    }

    #[tokio::test]
    async fn the_selector_sees_the_original_error() {
        let recovered = throw_error::<String>(StreamError::msg("root cause"))
            .catch_error(|error| vec![error.to_string()])
            .to_vec()
            .await
            .unwrap();
        assert_eq!(recovered, vec!["root cause"]);
    }

    #[tokio::test]
    async fn healthy_streams_never_invoke_the_selector() {
        let passed = from_iter([1, 2])
            .catch_error(|_| vec![9])
            .to_vec()
            .await
            .unwrap();
        assert_eq!(passed, vec![1, 2]);
    }

    #[tokio::test]
    async fn fallback_errors_are_terminal() {
        let error = throw_error::<i32>(StreamError::msg("first"))
            .catch_error(|_| throw_error::<i32>(StreamError::msg("second")))
            .to_vec()
            .await
            .unwrap_err();
        assert_eq!(error.to_string(), "second");
    }
}
