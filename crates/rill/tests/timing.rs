//! Timing behavior under the paused test clock: debounce close semantics
//! and the combine-latest timeline.

use std::time::Duration;

use rill::{combine_latest, QueuingStrategy, Source};
use tokio::time::Instant;

/// Emit each value at its millisecond offset from subscription, closing at
/// `close_at`.
fn timed<T: Send + 'static>(items: Vec<(u64, T)>, close_at: u64) -> Source<T> {
    Source::new(QueuingStrategy::default(), move |controller| async move {
        let start = Instant::now();
        for (at, value) in items {
            tokio::time::sleep_until(start + Duration::from_millis(at)).await;
            if controller.enqueue(value).is_err() {
                return Ok(());
            }
        }
        tokio::time::sleep_until(start + Duration::from_millis(close_at)).await;
        controller.close();
        Ok(())
    })
}

#[tokio::test(start_paused = true)]
async fn debounce_holds_the_pending_chunk_for_the_full_quiet_window() {
    let start = Instant::now();
    // 1 at t=0, 2 at t=10, upstream closes at t=20.
    let debounced = timed(vec![(0, 1), (10, 2)], 20)
        .debounce_time(Duration::from_millis(50))
        .map_sync(move |n| (n, start.elapsed()))
        .to_vec()
        .await
        .unwrap();

    assert_eq!(debounced.len(), 1);
    let (value, at) = debounced[0];
    assert_eq!(value, 2);
    // Emitted no earlier than 50ms after the chunk at t=10.
    assert!(at >= Duration::from_millis(60));
}

#[tokio::test(start_paused = true)]
async fn combine_latest_follows_the_marble_timeline() {
    let start = Instant::now();
    // A: a1 at 20, a2 at 60, complete at 90.
    // B: b1 at 40, b2 at 80, complete at 100.
    let a = timed(vec![(20, "a1"), (60, "a2")], 90);
    let b = timed(vec![(40, "b1"), (80, "b2")], 100);

    let stamped = combine_latest(a, b)
        .map_sync(move |pair| (pair, start.elapsed()))
        .to_vec()
        .await
        .unwrap();
    let completed_at = start.elapsed();

    let values: Vec<_> = stamped.iter().map(|(pair, _)| *pair).collect();
    assert_eq!(
        values,
        vec![("a1", "b1"), ("a2", "b1"), ("a2", "b2")],
        "one tuple per update once both sides have emitted"
    );

    let times: Vec<_> = stamped.iter().map(|(_, at)| *at).collect();
    assert!(times[0] >= Duration::from_millis(40));
    assert!(times[0] < Duration::from_millis(60));
    assert!(times[1] >= Duration::from_millis(60));
    assert!(times[1] < Duration::from_millis(80));
    assert!(times[2] >= Duration::from_millis(80));

    // The output only completes once the later source has completed.
    assert!(completed_at >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn delay_defers_without_reordering() {
    let start = Instant::now();
    let delayed = timed(vec![(0, 'x'), (5, 'y')], 10)
        .delay(Duration::from_millis(40))
        .map_sync(move |c| (c, start.elapsed()))
        .to_vec()
        .await
        .unwrap();
    let values: Vec<_> = delayed.iter().map(|(c, _)| *c).collect();
    assert_eq!(values, vec!['x', 'y']);
    assert!(delayed[0].1 >= Duration::from_millis(40));
}

#[tokio::test(start_paused = true)]
async fn timeout_is_measured_between_chunks() {
    let punctual = timed(vec![(10, 1), (40, 2), (70, 3)], 80)
        .timeout(Duration::from_millis(50))
        .to_vec()
        .await
        .unwrap();
    assert_eq!(punctual, vec![1, 2, 3]);

    let error = timed(vec![(10, 1)], 500)
        .timeout(Duration::from_millis(50))
        .to_vec()
        .await
        .unwrap_err();
    assert_eq!(error.to_string(), "Stream timeout after 50ms");
}
