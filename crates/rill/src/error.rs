use std::fmt;
use std::sync::Arc;

/// Terminal failure of a stream.
///
/// A stream terminates at most once, so every consumer and every branch of a
/// split observes the same error value. Errors are therefore cheap to clone:
/// structured variants carry plain data and opaque causes are shared behind
/// an [`Arc`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    /// A `tee` branch could not absorb a chunk under the `throw` or `cancel`
    /// overflow policy.
    #[error("Queue overflow on branch {0}")]
    QueueOverflow(usize),

    /// No chunk arrived within the configured window of the `timeout`
    /// operator.
    #[error("Stream timeout after {0}ms")]
    Timeout(u128),

    /// A failure described only by its message.
    #[error("{0}")]
    Message(Arc<str>),

    /// An opaque failure raised by user code (producers, transforms,
    /// bridged streams).
    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

impl StreamError {
    /// Build an error from anything displayable.
    pub fn msg(message: impl fmt::Display) -> Self {
        StreamError::Message(message.to_string().into())
    }
}

impl From<anyhow::Error> for StreamError {
    fn from(source: anyhow::Error) -> Self {
        StreamError::Other(Arc::new(source))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
