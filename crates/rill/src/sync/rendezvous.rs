use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use super::Latch;

/// The queue was closed while an operation was in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Closed;

/// Zero-capacity channel: [`push`](RendezvousQueue::push) and
/// [`pull`](RendezvousQueue::pull) both block until the opposite side
/// arrives.
///
/// This is the bridge between an unknown number of concurrent producers and
/// a single sequential consumer: because a push only completes at the moment
/// a puller takes the value, producers inherit the consumer's pace without
/// any intermediate buffering. [`close`](RendezvousQueue::close) releases
/// everything parked on either side.
#[derive(Debug, Default)]
pub struct RendezvousQueue<T> {
    state: Mutex<State<T>>,
    item_placed: Latch,
    slot_freed: Latch,
}

#[derive(Debug)]
struct State<T> {
    slot: Option<(T, oneshot::Sender<()>)>,
    closed: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        State {
            slot: None,
            closed: false,
        }
    }
}

impl<T> RendezvousQueue<T> {
    pub fn new() -> Self {
        RendezvousQueue {
            state: Mutex::new(State::default()),
            item_placed: Latch::new(),
            slot_freed: Latch::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `value` to a puller, waiting until one takes it.
    ///
    /// Multiple pushers queue cooperatively on the single slot. The value is
    /// dropped if the queue closes before a puller arrives.
    pub async fn push(&self, value: T) -> Result<(), Closed> {
        let mut value = Some(value);
        let taken = loop {
            let wait = self.slot_freed.wait();
            {
                let mut state = self.state();
                if state.closed {
                    return Err(Closed);
                }
                if state.slot.is_none() {
                    let (ack, taken) = oneshot::channel();
                    state.slot = Some((value.take().expect("pushed value consumed once"), ack));
                    self.item_placed.signal();
                    break taken;
                }
            }
            wait.await;
        };
        taken.await.map_err(|_| Closed)
    }

    /// Take the next pushed value, waiting until one is placed.
    pub async fn pull(&self) -> Result<T, Closed> {
        loop {
            let wait = self.item_placed.wait();
            {
                let mut state = self.state();
                if let Some((value, ack)) = state.slot.take() {
                    let _ = ack.send(());
                    self.slot_freed.signal();
                    return Ok(value);
                }
                if state.closed {
                    return Err(Closed);
                }
            }
            wait.await;
        }
    }

    /// Close the queue: the parked value (if any) is dropped and every
    /// pending or future `push`/`pull` returns [`Closed`].
    pub fn close(&self) {
        let dropped = {
            let mut state = self.state();
            state.closed = true;
            state.slot.take()
        };
        drop(dropped);
        self.item_placed.signal();
        self.slot_freed.signal();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn push_blocks_until_pulled() {
        let queue = Arc::new(RendezvousQueue::new());
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(7).await })
        };
        tokio::task::yield_now().await;
        assert!(!pusher.is_finished());

        assert_eq!(queue.pull().await, Ok(7));
        pusher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pull_blocks_until_pushed() {
        let queue = Arc::new(RendezvousQueue::new());
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull().await })
        };
        tokio::task::yield_now().await;
        assert!(!puller.is_finished());

        queue.push(3).await.unwrap();
        assert_eq!(puller.await.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn concurrent_pushers_all_rendezvous() {
        let queue = Arc::new(RendezvousQueue::new());
        let mut pushers = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            pushers.push(tokio::spawn(async move { queue.push(i).await }));
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(queue.pull().await.unwrap());
        }
        for pusher in pushers {
            pusher.await.unwrap().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn close_releases_both_sides() {
        let queue = Arc::new(RendezvousQueue::<u32>::new());
        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull().await })
        };
        let pusher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                // Fill the slot, then push again so the second push parks.
                queue.push(1).await.ok();
                queue.push(2).await
            })
        };
        tokio::task::yield_now().await;
        queue.close();

        assert!(timeout(Duration::from_secs(1), puller)
            .await
            .expect("puller must unblock")
            .is_ok());
        assert_eq!(
            timeout(Duration::from_secs(1), pusher)
                .await
                .expect("pusher must unblock")
                .unwrap(),
            Err(Closed)
        );
        assert!(queue.push(9).await.is_err());
        assert!(queue.pull().await.is_err());
    }
}
