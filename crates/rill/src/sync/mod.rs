//! Cooperative coordination primitives used by the concurrency operators.
//!
//! None of these are OS-backed; they are small async queues scheduled by the
//! runtime, which keeps every wait a cancellation checkpoint.

mod gate;
mod latch;
mod rendezvous;

pub use gate::Gate;
pub use latch::{Latch, Wait};
pub use rendezvous::{Closed, RendezvousQueue};
