//! Multi-source combinators.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::create::from_iter;
use crate::error::StreamError;
use crate::source::{Reader, Source};
use crate::strategy::QueuingStrategy;
use crate::sync::Latch;

use super::forward::{cancel_reader, pump};

impl<T: Send + 'static> Source<T> {
    /// Pair every chunk with the most recent chunk of `other`.
    ///
    /// Chunks arriving before `other` has emitted at least once are dropped
    /// silently. The output follows this source's lifetime; `other` is
    /// cancelled when it ends.
    pub fn with_latest_from<O>(self, other: Source<O>) -> Source<(T, O)>
    where
        O: Clone + Send + 'static,
    {
        let strategy = self.strategy();
        Source::new(strategy, move |controller| async move {
            let latest: Arc<Mutex<Option<O>>> = Arc::new(Mutex::new(None));
            let failed: Arc<Mutex<Option<StreamError>>> = Arc::new(Mutex::new(None));
            let token = CancellationToken::new();
            {
                let latest = latest.clone();
                let failed = failed.clone();
                let token = token.clone();
                let mut other = other.into_reader();
                tokio::spawn(async move {
                    loop {
                        let outcome = tokio::select! {
                            biased;
                            () = token.cancelled() => {
                                other.cancel();
                                return;
                            }
                            outcome = other.read() => outcome,
                        };
                        match outcome {
                            Ok(Some(value)) => {
                                *latest.lock().unwrap_or_else(PoisonError::into_inner) =
                                    Some(value);
                            }
                            Ok(None) => return,
                            Err(error) => {
                                *failed.lock().unwrap_or_else(PoisonError::into_inner) =
                                    Some(error);
                                return;
                            }
                        }
                    }
                });
            }

            let mut reader = self.into_reader();
            loop {
                match controller.ready().await {
                    Ok(()) => {}
                    Err(terminated) => {
                        token.cancel();
                        cancel_reader(reader, terminated);
                        return Ok(());
                    }
                }
                let failure = failed.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(error) = failure {
                    token.cancel();
                    reader.cancel_with_reason(error.to_string());
                    return Err(error);
                }
                match reader.read().await {
                    Ok(Some(chunk)) => {
                        let snapshot = latest
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clone();
                        if let Some(other_value) = snapshot {
                            if let Err(terminated) = controller.enqueue((chunk, other_value)) {
                                token.cancel();
                                cancel_reader(reader, terminated);
                                return Ok(());
                            }
                        }
                    }
                    Ok(None) => {
                        controller.close();
                        token.cancel();
                        return Ok(());
                    }
                    Err(error) => {
                        token.cancel();
                        return Err(error);
                    }
                }
            }
        })
    }
}

/// Per-source slot used by the combine-latest machinery. Feeders park on
/// `pending` until the combiner takes it, so no source can lap the
/// combiner within a single slot.
struct CombineSlot<V> {
    pending: Option<V>,
    latest: Option<V>,
    done: bool,
}

impl<V> CombineSlot<V> {
    fn new() -> Self {
        CombineSlot {
            pending: None,
            latest: None,
            done: false,
        }
    }
}

struct CombineShared<St> {
    state: Mutex<St>,
    /// A feeder placed a value, finished or failed.
    dirty: Latch,
    /// The combiner consumed a pending value.
    taken: Latch,
    token: CancellationToken,
}

impl<St> CombineShared<St> {
    fn new(state: St) -> Self {
        CombineShared {
            state: Mutex::new(state),
            dirty: Latch::new(),
            taken: Latch::new(),
            token: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, St> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drive one feeder: read a source and hand each chunk to `place`, parking
/// until the combiner takes the previous one. `settle` records termination.
async fn feed<V, St, Pl, Se>(
    shared: Arc<CombineShared<St>>,
    mut reader: Reader<V>,
    mut place: Pl,
    settle: Se,
) where
    V: Send + 'static,
    St: Send + 'static,
    Pl: FnMut(&mut St, V) -> Option<V> + Send + 'static,
    Se: FnOnce(&mut St, Option<StreamError>) + Send + 'static,
{
    loop {
        let outcome = tokio::select! {
            biased;
            () = shared.token.cancelled() => {
                reader.cancel();
                return;
            }
            outcome = reader.read() => outcome,
        };
        match outcome {
            Ok(Some(value)) => {
                let mut value = Some(value);
                loop {
                    let wait = shared.taken.wait();
                    {
                        let mut state = shared.state();
                        match place(&mut *state, value.take().expect("value placed once")) {
                            None => {
                                shared.dirty.signal();
                                break;
                            }
                            Some(back) => value = Some(back),
                        }
                    }
                    tokio::select! {
                        biased;
                        () = shared.token.cancelled() => {
                            reader.cancel();
                            return;
                        }
                        () = wait => {}
                    }
                }
            }
            Ok(None) => {
                settle(&mut *shared.state(), None);
                shared.dirty.signal();
                return;
            }
            Err(error) => {
                settle(&mut *shared.state(), Some(error));
                shared.dirty.signal();
                return;
            }
        }
    }
}

struct PairState<A, B> {
    left: CombineSlot<A>,
    right: CombineSlot<B>,
    error: Option<StreamError>,
    cursor: usize,
}

enum CombineTurn<V> {
    Emit(V),
    Progress,
    Close,
    Fail(StreamError),
    Idle,
}

/// Emit a combined tuple every time either source emits, once both have
/// emitted at least once; complete when both sources have completed.
pub fn combine_latest<A, B>(left: Source<A>, right: Source<B>) -> Source<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let shared = Arc::new(CombineShared::new(PairState {
            left: CombineSlot::new(),
            right: CombineSlot::new(),
            error: None,
            cursor: 0,
        }));
        tokio::spawn(feed(
            shared.clone(),
            left.into_reader(),
            |state: &mut PairState<A, B>, value| match state.left.pending {
                None => {
                    state.left.pending = Some(value);
                    None
                }
                Some(_) => Some(value),
            },
            |state: &mut PairState<A, B>, error| {
                state.left.done = true;
                if error.is_some() && state.error.is_none() {
                    state.error = error;
                }
            },
        ));
        tokio::spawn(feed(
            shared.clone(),
            right.into_reader(),
            |state: &mut PairState<A, B>, value| match state.right.pending {
                None => {
                    state.right.pending = Some(value);
                    None
                }
                Some(_) => Some(value),
            },
            |state: &mut PairState<A, B>, error| {
                state.right.done = true;
                if error.is_some() && state.error.is_none() {
                    state.error = error;
                }
            },
        ));

        loop {
            let wait = shared.dirty.wait();
            let turn = {
                let mut state = shared.state();
                if let Some(error) = state.error.take() {
                    CombineTurn::Fail(error)
                } else {
                    let mut turn = CombineTurn::Idle;
                    for offset in 0..2 {
                        let index = (state.cursor + offset) % 2;
                        let took = if index == 0 {
                            state.left.pending.take().map(|value| {
                                state.left.latest = Some(value);
                            })
                        } else {
                            state.right.pending.take().map(|value| {
                                state.right.latest = Some(value);
                            })
                        };
                        if took.is_some() {
                            state.cursor = (index + 1) % 2;
                            shared.taken.signal();
                            turn = match (&state.left.latest, &state.right.latest) {
                                (Some(a), Some(b)) => {
                                    CombineTurn::Emit((a.clone(), b.clone()))
                                }
                                _ => CombineTurn::Progress,
                            };
                            break;
                        }
                    }
                    if matches!(turn, CombineTurn::Idle)
                        && state.left.done
                        && state.right.done
                    {
                        turn = CombineTurn::Close;
                    }
                    turn
                }
            };
            match turn {
                CombineTurn::Emit(pair) => {
                    if controller.ready().await.is_err() {
                        shared.token.cancel();
                        return Ok(());
                    }
                    if controller.enqueue(pair).is_err() {
                        shared.token.cancel();
                        return Ok(());
                    }
                }
                CombineTurn::Progress => {}
                CombineTurn::Close => {
                    controller.close();
                    shared.token.cancel();
                    return Ok(());
                }
                CombineTurn::Fail(error) => {
                    shared.token.cancel();
                    return Err(error);
                }
                CombineTurn::Idle => {
                    tokio::select! {
                        biased;
                        _ = controller.closed() => {
                            shared.token.cancel();
                            return Ok(());
                        }
                        () = wait => {}
                    }
                }
            }
        }
    })
}

struct ManyState<T> {
    slots: Vec<CombineSlot<T>>,
    error: Option<StreamError>,
    cursor: usize,
}

/// Homogeneous n-ary [`combine_latest`]: emit the latest value of every
/// source whenever any of them emits. An empty input completes
/// immediately.
pub fn combine_latest_all<T>(sources: Vec<Source<T>>) -> Source<Vec<T>>
where
    T: Clone + Send + 'static,
{
    if sources.is_empty() {
        return crate::create::empty();
    }
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let count = sources.len();
        let shared = Arc::new(CombineShared::new(ManyState {
            slots: (0..count).map(|_| CombineSlot::new()).collect(),
            error: None,
            cursor: 0,
        }));
        for (index, source) in sources.into_iter().enumerate() {
            tokio::spawn(feed(
                shared.clone(),
                source.into_reader(),
                move |state: &mut ManyState<T>, value| match state.slots[index].pending {
                    None => {
                        state.slots[index].pending = Some(value);
                        None
                    }
                    Some(_) => Some(value),
                },
                move |state: &mut ManyState<T>, error| {
                    state.slots[index].done = true;
                    if error.is_some() && state.error.is_none() {
                        state.error = error;
                    }
                },
            ));
        }

        loop {
            let wait = shared.dirty.wait();
            let turn = {
                let mut state = shared.state();
                if let Some(error) = state.error.take() {
                    CombineTurn::Fail(error)
                } else {
                    let mut turn = CombineTurn::Idle;
                    for offset in 0..count {
                        let index = (state.cursor + offset) % count;
                        if let Some(value) = state.slots[index].pending.take() {
                            state.slots[index].latest = Some(value);
                            state.cursor = (index + 1) % count;
                            shared.taken.signal();
                            let snapshot: Option<Vec<T>> = state
                                .slots
                                .iter()
                                .map(|slot| slot.latest.clone())
                                .collect();
                            turn = match snapshot {
                                Some(combined) => CombineTurn::Emit(combined),
                                None => CombineTurn::Progress,
                            };
                            break;
                        }
                    }
                    if matches!(turn, CombineTurn::Idle)
                        && state.slots.iter().all(|slot| slot.done)
                    {
                        turn = CombineTurn::Close;
                    }
                    turn
                }
            };
            match turn {
                CombineTurn::Emit(combined) => {
                    if controller.ready().await.is_err() {
                        shared.token.cancel();
                        return Ok(());
                    }
                    if controller.enqueue(combined).is_err() {
                        shared.token.cancel();
                        return Ok(());
                    }
                }
                CombineTurn::Progress => {}
                CombineTurn::Close => {
                    controller.close();
                    shared.token.cancel();
                    return Ok(());
                }
                CombineTurn::Fail(error) => {
                    shared.token.cancel();
                    return Err(error);
                }
                CombineTurn::Idle => {
                    tokio::select! {
                        biased;
                        _ = controller.closed() => {
                            shared.token.cancel();
                            return Ok(());
                        }
                        () = wait => {}
                    }
                }
            }
        }
    })
}

/// Mirror whichever source is first to produce a chunk, an error or a
/// close; the losers are cancelled at the moment of decision.
///
/// # Panics
///
/// Panics on an empty input: "race requires at least one source stream".
pub fn race<T: Send + 'static>(sources: Vec<Source<T>>) -> Source<T> {
    assert!(
        !sources.is_empty(),
        "race requires at least one source stream"
    );
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let winner: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));
        for (index, source) in sources.into_iter().enumerate() {
            let controller = controller.clone();
            let winner = winner.clone();
            tokio::spawn(async move {
                let mut reader = source.into_reader();
                let first = tokio::select! {
                    biased;
                    terminated = controller.closed() => {
                        cancel_reader(reader, terminated);
                        return;
                    }
                    outcome = reader.read() => outcome,
                };
                let claimed = {
                    let mut winner = winner.lock().unwrap_or_else(PoisonError::into_inner);
                    if winner.is_none() {
                        *winner = Some(index);
                        true
                    } else {
                        false
                    }
                };
                if !claimed {
                    reader.cancel_with_reason("lost the race");
                    return;
                }
                match first {
                    Ok(Some(chunk)) => {
                        if let Err(terminated) = controller.enqueue(chunk) {
                            cancel_reader(reader, terminated);
                            return;
                        }
                        if let Err(error) = pump(&controller, reader).await {
                            controller.error(error);
                        }
                    }
                    Ok(None) => controller.close(),
                    Err(error) => controller.error(error),
                }
            });
        }
        Ok(())
    })
}

/// Flatten `sources` concurrently without a limit.
pub fn merge<T: Send + 'static>(sources: Vec<Source<T>>) -> Source<T> {
    from_iter(sources).merge_all(usize::MAX)
}

/// Drain `sources` one after another, in order.
pub fn concat<T: Send + 'static>(sources: Vec<Source<T>>) -> Source<T> {
    from_iter(sources).concat_all()
}
