//! Sequential flattening.

use crate::source::{IntoSource, Source, Terminated};

impl<S> Source<S>
where
    S: IntoSource + Send + 'static,
{
    /// Flatten a stream of stream-like items by draining each inner source
    /// to completion, in arrival order, one at a time.
    ///
    /// The next outer item is only read once the current inner has closed
    /// and the downstream asks for more, so a chunk of inner `k` is never
    /// emitted before every chunk of inners `0..k`.
    pub fn concat_all(self) -> Source<S::Item> {
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            let mut outer = self.into_reader();
            'outer: loop {
                match controller.ready().await {
                    Ok(()) => {}
                    Err(terminated) => {
                        super::forward::cancel_reader(outer, terminated);
                        return Ok(());
                    }
                }
                let item = match outer.read().await {
                    Ok(Some(item)) => item,
                    Ok(None) => {
                        controller.close();
                        return Ok(());
                    }
                    Err(error) => return Err(error),
                };
                let mut inner = item.into_source().into_reader();
                loop {
                    match controller.ready().await {
                        Ok(()) => {}
                        Err(terminated) => {
                            match terminated {
                                Terminated::Cancelled(reason) => {
                                    inner.cancel_opt(reason.clone());
                                    outer.cancel_opt(reason);
                                }
                                Terminated::Closed => {
                                    inner.cancel();
                                    outer.cancel();
                                }
                            }
                            return Ok(());
                        }
                    }
                    match inner.read().await {
                        Ok(Some(chunk)) => {
                            if let Err(terminated) = controller.enqueue(chunk) {
                                match terminated {
                                    Terminated::Cancelled(reason) => {
                                        inner.cancel_opt(reason.clone());
                                        outer.cancel_opt(reason);
                                    }
                                    Terminated::Closed => {
                                        inner.cancel();
                                        outer.cancel();
                                    }
                                }
                                return Ok(());
                            }
                        }
                        Ok(None) => continue 'outer,
                        Err(error) => {
                            outer.cancel_with_reason(error.to_string());
                            return Err(error);
                        }
                    }
                }
            }
        })
    }
}
