//! Latest-wins flattening.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::source::{IntoSource, Reader, Source};
use crate::sync::RendezvousQueue;

enum Flow<T> {
    /// A chunk stamped with the epoch of the inner that produced it; stale
    /// epochs are dropped by the consumer.
    Chunk(u64, T),
    Finish,
}

struct SwitchState {
    /// Bumped on every switch; an inner owns the stream only while its
    /// epoch is current.
    epoch: u64,
    inner_active: bool,
    outer_done: bool,
    error: Option<StreamError>,
    inner_token: Option<CancellationToken>,
}

struct SwitchShared<T> {
    state: Mutex<SwitchState>,
    queue: RendezvousQueue<Flow<T>>,
    token: CancellationToken,
}

impl<T> SwitchShared<T> {
    fn state(&self) -> MutexGuard<'_, SwitchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latch_error(&self, error: StreamError) {
        let mut state = self.state();
        if state.error.is_none() {
            state.error = Some(error);
        } else {
            log::debug!("switch_all swallowing secondary error: {error}");
        }
    }
}

async fn drain_inner<T: Send + 'static>(
    shared: Arc<SwitchShared<T>>,
    epoch: u64,
    revoked: CancellationToken,
    mut inner: Reader<T>,
) {
    loop {
        let outcome = tokio::select! {
            biased;
            () = revoked.cancelled() => {
                inner.cancel();
                return;
            }
            outcome = inner.read() => outcome,
        };
        match outcome {
            Ok(Some(chunk)) => {
                // Ownership check: a read that settled after a switch is
                // dropped, not emitted.
                if shared.state().epoch != epoch {
                    log::debug!("dropping chunk read by a revoked inner");
                    inner.cancel();
                    return;
                }
                if shared.queue.push(Flow::Chunk(epoch, chunk)).await.is_err() {
                    inner.cancel();
                    return;
                }
            }
            Ok(None) => {
                let finish = {
                    let mut state = shared.state();
                    if state.epoch == epoch {
                        state.inner_active = false;
                        state.outer_done
                    } else {
                        false
                    }
                };
                if finish {
                    let _ = shared.queue.push(Flow::Finish).await;
                }
                return;
            }
            Err(error) => {
                if shared.state().epoch == epoch {
                    shared.latch_error(error);
                    let _ = shared.queue.push(Flow::Finish).await;
                } else {
                    log::debug!("ignoring error from a revoked inner: {error}");
                }
                return;
            }
        }
    }
}

async fn monitor_outer<T, S, P>(shared: Arc<SwitchShared<S::Item>>, outer: Source<T>, mut project: P)
where
    T: Send + 'static,
    S: IntoSource + Send + 'static,
    P: FnMut(T, CancellationToken) -> S + Send + 'static,
{
    let mut outer = outer.into_reader();
    loop {
        let item = tokio::select! {
            biased;
            () = shared.token.cancelled() => {
                outer.cancel();
                return;
            }
            item = outer.read() => item,
        };
        match item {
            Ok(Some(item)) => {
                // Revoke the current inner and install the new one.
                let (epoch, fresh) = {
                    let mut state = shared.state();
                    state.epoch += 1;
                    state.inner_active = true;
                    let revoked = state.inner_token.take();
                    let fresh = shared.token.child_token();
                    state.inner_token = Some(fresh.clone());
                    if let Some(revoked) = revoked {
                        revoked.cancel();
                    }
                    (state.epoch, fresh)
                };
                let inner = project(item, fresh.clone()).into_source().into_reader();
                tokio::spawn(drain_inner(shared.clone(), epoch, fresh, inner));
            }
            Ok(None) => {
                let finish = {
                    let mut state = shared.state();
                    state.outer_done = true;
                    !state.inner_active
                };
                if finish {
                    let _ = shared.queue.push(Flow::Finish).await;
                }
                return;
            }
            Err(error) => {
                shared.latch_error(error);
                let _ = shared.queue.push(Flow::Finish).await;
                return;
            }
        }
    }
}

fn switch_core<T, S, P>(outer: Source<T>, project: P) -> Source<S::Item>
where
    T: Send + 'static,
    S: IntoSource + Send + 'static,
    P: FnMut(T, CancellationToken) -> S + Send + 'static,
{
    let strategy = outer.strategy();
    Source::new(strategy, move |controller| async move {
        let shared = Arc::new(SwitchShared {
            state: Mutex::new(SwitchState {
                epoch: 0,
                inner_active: false,
                outer_done: false,
                error: None,
                inner_token: None,
            }),
            queue: RendezvousQueue::new(),
            token: CancellationToken::new(),
        });
        tokio::spawn(monitor_outer::<T, S, P>(shared.clone(), outer, project));

        loop {
            if controller.ready().await.is_err() {
                shared.token.cancel();
                shared.queue.close();
                return Ok(());
            }
            if let Some(error) = shared.state().error.clone() {
                shared.token.cancel();
                shared.queue.close();
                return Err(error);
            }
            let flow = tokio::select! {
                biased;
                _ = controller.closed() => {
                    shared.token.cancel();
                    shared.queue.close();
                    return Ok(());
                }
                flow = shared.queue.pull() => flow,
            };
            match flow {
                Ok(Flow::Chunk(epoch, chunk)) => {
                    if shared.state().epoch != epoch {
                        continue;
                    }
                    if controller.enqueue(chunk).is_err() {
                        shared.token.cancel();
                        shared.queue.close();
                        return Ok(());
                    }
                }
                Ok(Flow::Finish) => {
                    let error = shared.state().error.clone();
                    shared.token.cancel();
                    shared.queue.close();
                    return match error {
                        Some(error) => Err(error),
                        None => {
                            controller.close();
                            Ok(())
                        }
                    };
                }
                Err(_) => return Ok(()),
            }
        }
    })
}

impl<S> Source<S>
where
    S: IntoSource + Send + 'static,
{
    /// Flatten a stream of stream-like items by always draining the most
    /// recent one: each new outer item revokes and cancels the inner it
    /// replaces, discarding chunks still in flight. The output completes
    /// once the outer stream and the final inner have both closed.
    pub fn switch_all(self) -> Source<S::Item> {
        switch_core::<S, S, _>(self, |item, _revoked| item)
    }
}

impl<T: Send + 'static> Source<T> {
    /// Project every chunk to a stream-like value and switch to it; see
    /// [`switch_all`](Source::switch_all).
    ///
    /// The projection receives a [`CancellationToken`] that fires at the
    /// moment the projected source is revoked (or the whole pipeline is
    /// torn down), so external work such as network requests can be
    /// abandoned cooperatively.
    pub fn switch_map<S, P>(self, project: P) -> Source<S::Item>
    where
        S: IntoSource + Send + 'static,
        P: FnMut(T, CancellationToken) -> S + Send + 'static,
    {
        switch_core::<T, S, P>(self, project)
    }
}
