//! Hub error types

/// Error type for hub operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Hub has been shut down
    #[error("broadcast hub is closed")]
    Closed,

    /// Event payload could not be serialized
    #[error("failed to encode event payload: {0}")]
    Encode(String),

    /// Transport to the subscribers failed
    #[error("broadcast transport failed: {0}")]
    Transport(String),
}

/// Error returned by [`Subscription::recv`](super::Subscription::recv)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// The subscriber fell behind and skipped this many events
    #[error("subscriber lagged, {0} events skipped")]
    Lagged(u64),

    /// Hub has been shut down
    #[error("broadcast hub is closed")]
    Closed,
}
