use tokio::sync::Semaphore;

/// Counting semaphore with explicit release.
///
/// Unlike a guard-based semaphore, permits are returned by an explicit
/// [`Gate::release`]: the acquirer and the releaser are routinely different
/// tasks (`merge_all` acquires before reading the outer stream and releases
/// when the spawned inner completes). Waiters are woken in FIFO order.
#[derive(Debug)]
pub struct Gate {
    permits: Semaphore,
}

impl Gate {
    /// Create a gate with `permits` initial permits.
    ///
    /// Values beyond the runtime's semaphore limit are clamped, so
    /// `Gate::new(usize::MAX)` behaves as "unbounded".
    pub fn new(permits: usize) -> Self {
        Gate {
            permits: Semaphore::new(permits.min(Semaphore::MAX_PERMITS)),
        }
    }

    /// Take one permit, waiting FIFO behind earlier acquirers if none is
    /// available.
    pub async fn acquire(&self) {
        self.permits
            .acquire()
            .await
            .expect("gate semaphore is never closed")
            .forget();
    }

    /// Return one permit, waking the longest-waiting acquirer if any.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_consumes_permits() {
        let gate = Gate::new(2);
        gate.acquire().await;
        gate.acquire().await;
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test]
    async fn release_wakes_a_queued_waiter() {
        let gate = Arc::new(Gate::new(1));
        gate.acquire().await;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.release();
        waiter.await.unwrap();
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test]
    async fn unbounded_gate_never_blocks() {
        let gate = Gate::new(usize::MAX);
        for _ in 0..64 {
            gate.acquire().await;
        }
    }
}
