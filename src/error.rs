//! Relay error types.
//!
//! [`RelayError`] is the central error type for the crate. Callers of the
//! [`Notifier`](crate::notifier::Notifier) API only ever observe a subset
//! of the variants; the rest surface through the actor's failure path.

/// Central error enum for the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Topic failed validation (empty or contains characters outside
    /// `[A-Za-z0-9_]`).
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),

    /// Channel prefix failed validation (empty or contains characters
    /// outside `[A-Za-z0-9_]`).
    #[error("invalid channel prefix: {0:?}")]
    InvalidPrefix(String),

    /// The database delivered a notification on a channel that does not
    /// match the expected naming convention. The actor never issues a
    /// LISTEN for such a channel, so this is an invariant violation and
    /// terminates the actor.
    #[error("unexpected notification channel: {0:?}")]
    UnknownChannel(String),

    /// Failure propagated from the database driver.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A command was issued while the underlying connection was down.
    #[error("not connected to the database")]
    Disconnected,

    /// The notifier actor is no longer running. Returned to callers whose
    /// request could not be delivered or whose pending reply was dropped.
    #[error("notifier is shut down")]
    Shutdown,
}
