//! Reactive operators for pull-based async streams.
//!
//! A [`Source`] is a buffered pull stream: chunks flow from a producer task
//! through a bounded queue to exactly one consumer, with demand signalled
//! back through the queue's desired size. Operators wrap a source in a new
//! one, creators build sources from ordinary values, and consumers drain
//! them:
//!
//! ```no_run
//! use rill::{from_iter, StreamError};
//!
//! # async fn example() -> Result<(), StreamError> {
//! let doubled = from_iter([1, 2, 3, 4])
//!     .filter(|n| n % 2 == 0)
//!     .map_sync(|n| n * 10)
//!     .to_vec()
//!     .await?;
//! assert_eq!(doubled, vec![20, 40]);
//! # Ok(())
//! # }
//! ```
//!
//! Backpressure is cooperative: no operator produces a chunk while its
//! downstream is saturated, and pausing the end of a pipeline pauses every
//! producer above it. Cancellation is cooperative too: dropping or
//! cancelling a reader propagates upstream, releasing producers, timers and
//! inner streams along the way.

pub mod consume;
pub mod create;
pub mod error;
pub mod ops;
pub mod source;
pub mod strategy;
pub mod sync;

pub use consume::Subscription;
pub use create::{
    defer, empty, from_future, from_iter, from_stream, from_try_stream, interval, range, throw_error,
    timer, timer_with_period,
};
pub use error::{Result, StreamError};
pub use ops::{
    combine_latest, combine_latest_all, concat, merge, race, tee, Overflow, TeeOptions,
    ThrottleConfig,
};
pub use source::{Controller, IntoSource, Reader, Source, Terminated};
pub use strategy::QueuingStrategy;
