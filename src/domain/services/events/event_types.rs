//--------------------------------------------------------------------------------------------------
// ENUMS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                       | Variants            |
// |---------------|---------------------------------------------------|---------------------|
// | EventError    | Failures on the outbound notification path        | PublishError        |
// |               |                                                   | ListenerError       |
//--------------------------------------------------------------------------------------------------

use thiserror::Error;

/// Errors that can occur while fanning notifications out.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to publish a message onto the bus
    #[error("Failed to publish message: {0}")]
    PublishError(String),

    /// A listener failed to process a message
    #[error("Listener failed to process message: {0}")]
    ListenerError(String),
}

/// Type alias for Result with EventError
pub type EventResult<T> = Result<T, EventError>;
