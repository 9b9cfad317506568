//! Single-producer, multi-consumer splitting.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StreamError;
use crate::source::{Controller, Source, Terminated};
use crate::strategy::QueuingStrategy;

/// What the splitter does when a branch's buffer is full at delivery time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Overflow {
    /// Pause the source until every branch has room; nothing overflows.
    #[default]
    Block,
    /// Fail only the overflowing branch; the others keep receiving.
    Throw,
    /// Fail every branch and cancel the source.
    Cancel,
}

impl FromStr for Overflow {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, StreamError> {
        match s {
            "block" => Ok(Overflow::Block),
            "throw" => Ok(Overflow::Throw),
            "cancel" => Ok(Overflow::Cancel),
            _ => Err(StreamError::msg(
                "overflow option must be either block, throw, or cancel",
            )),
        }
    }
}

/// Options for [`tee`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TeeOptions {
    pub overflow: Overflow,
    /// Per-branch buffer strategy; defaults to the source's own.
    pub strategy: Option<QueuingStrategy>,
}

struct TeeState<T> {
    source: Option<Source<T>>,
    /// One controller per branch; `None` once that branch terminated.
    controllers: Vec<Option<Controller<T>>>,
    /// Reason supplied by the most recently cancelled branch; propagated to
    /// the source once every branch is gone.
    last_reason: Option<String>,
}

struct TeeShared<T> {
    state: Mutex<TeeState<T>>,
    started: AtomicBool,
    overflow: Overflow,
}

impl<T> TeeShared<T> {
    fn state(&self) -> MutexGuard<'_, TeeState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> TeeShared<T> {
    /// First pull from any branch starts the one shared coordinator.
    fn ensure_started(self: Arc<Self>) {
        if !self.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(run(self));
        }
    }
}

/// Split `source` into `branches` independent outputs, each observing the
/// identical chunk sequence and terminal event.
///
/// A single-branch tee is the identity. The source is read lazily: an
/// abandoned split never pulls at all. One branch cancelling does not
/// disturb the others; the source itself is only cancelled once every
/// branch is gone, with the reason of the last cancellation.
///
/// # Panics
///
/// Panics if `branches` is zero: "Tee count must be at least 1".
pub fn tee<T>(source: Source<T>, branches: usize, options: TeeOptions) -> Vec<Source<T>>
where
    T: Clone + Send + 'static,
{
    assert!(branches >= 1, "Tee count must be at least 1");
    if branches == 1 {
        return vec![source];
    }
    let strategy = options.strategy.unwrap_or_else(|| source.strategy());
    let shared = Arc::new(TeeShared {
        state: Mutex::new(TeeState {
            source: Some(source),
            controllers: Vec::new(),
            last_reason: None,
        }),
        started: AtomicBool::new(false),
        overflow: options.overflow,
    });

    let mut outputs = Vec::with_capacity(branches);
    let mut controllers = Vec::with_capacity(branches);
    for _ in 0..branches {
        let hook = shared.clone();
        let (output, controller) =
            Source::with_controller(strategy, move |_| hook.ensure_started());
        outputs.push(output);
        controllers.push(Some(controller));
    }
    shared.state().controllers = controllers;
    outputs
}

fn accepts<T>(controller: &Controller<T>) -> bool {
    controller.desired_size().is_some_and(|size| size > 0) || controller.has_parked_reader()
}

enum Capacity {
    Proceed,
    AllBranchesGone(Option<String>),
}

/// Drop terminated branches, recording cancellation reasons, and return the
/// still-live `(index, controller)` pairs.
fn prune_live<T>(state: &mut TeeState<T>) -> Vec<(usize, Controller<T>)> {
    let mut live = Vec::new();
    for (index, slot) in state.controllers.iter_mut().enumerate() {
        if let Some(controller) = slot {
            match controller.termination() {
                Some(Terminated::Cancelled(reason)) => {
                    state.last_reason = reason;
                    *slot = None;
                }
                Some(Terminated::Closed) => {
                    *slot = None;
                }
                None => live.push((index, controller.clone())),
            }
        }
    }
    live
}

/// Wait until the overflow policy's pre-read predicate holds: every live
/// branch can accept under `Block`, any live branch under `Throw`/`Cancel`.
async fn wait_for_capacity<T: Clone + Send + 'static>(shared: &TeeShared<T>) -> Capacity {
    loop {
        let live = {
            let mut state = shared.state();
            let live = prune_live(&mut state);
            if live.is_empty() {
                return Capacity::AllBranchesGone(state.last_reason.take());
            }
            live
        };
        let satisfied = match shared.overflow {
            Overflow::Block => live.iter().all(|(_, controller)| accepts(controller)),
            Overflow::Throw | Overflow::Cancel => {
                live.iter().any(|(_, controller)| accepts(controller))
            }
        };
        if satisfied {
            return Capacity::Proceed;
        }
        // Park until demand changes (or a branch dies) somewhere relevant,
        // then re-evaluate.
        let waits = live
            .into_iter()
            .filter(|(_, controller)| !accepts(controller))
            .map(|(_, controller)| {
                Box::pin(async move {
                    let _ = controller.ready().await;
                })
            })
            .collect::<Vec<_>>();
        if waits.is_empty() {
            continue;
        }
        futures::future::select_all(waits).await;
    }
}

enum Deliver {
    Continue,
    CancelSource(String),
}

/// Enqueue one chunk into every live branch, applying the overflow policy
/// to branches whose buffer is full.
fn distribute<T: Clone + Send + 'static>(shared: &TeeShared<T>, chunk: T) -> Deliver {
    let mut state = shared.state();
    let live = prune_live(&mut state);

    if shared.overflow == Overflow::Cancel {
        if let Some((full, _)) = live.iter().find(|(_, controller)| !accepts(controller)) {
            let error = StreamError::QueueOverflow(*full);
            log::warn!("tee cancelling all branches: {error}");
            for (index, controller) in live {
                controller.error(error.clone());
                state.controllers[index] = None;
            }
            return Deliver::CancelSource(error.to_string());
        }
    }

    for (index, controller) in live {
        match shared.overflow {
            Overflow::Throw if !accepts(&controller) => {
                let error = StreamError::QueueOverflow(index);
                log::warn!("tee failing branch {index}: {error}");
                controller.error(error);
                state.controllers[index] = None;
            }
            _ => {
                // A branch cancelled since the capacity check simply misses
                // the chunk; it is pruned on the next pass.
                let _ = controller.enqueue(chunk.clone());
            }
        }
    }
    Deliver::Continue
}

async fn run<T: Clone + Send + 'static>(shared: Arc<TeeShared<T>>) {
    let source = shared
        .state()
        .source
        .take()
        .expect("tee coordinator runs once");
    let mut reader = source.into_reader();
    loop {
        match wait_for_capacity(&shared).await {
            Capacity::Proceed => {}
            Capacity::AllBranchesGone(reason) => {
                reader.cancel_opt(reason);
                return;
            }
        }
        match reader.read().await {
            Ok(Some(chunk)) => match distribute(&shared, chunk) {
                Deliver::Continue => {}
                Deliver::CancelSource(message) => {
                    reader.cancel_with_reason(message);
                    return;
                }
            },
            Ok(None) => {
                let mut state = shared.state();
                for (_, controller) in prune_live(&mut state) {
                    controller.close();
                }
                return;
            }
            Err(error) => {
                let mut state = shared.state();
                for (_, controller) in prune_live(&mut state) {
                    controller.error(error.clone());
                }
                return;
            }
        }
    }
}
