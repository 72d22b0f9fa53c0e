//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the outbound side of the relay: raw broker deliveries are decoded into
// TopicMessages, published on a broadcast bus and fanned out to listeners registered per host and
// topic filter.
//
// | Component                | Description                                                |
// |--------------------------|-----------------------------------------------------------|
// | EventBus                 | Broadcast bus of TopicMessage                             |
// | TopicListener            | Trait for components that receive notifications           |
// | MessageDispatcher        | Decodes deliveries and routes them to listeners           |
//--------------------------------------------------------------------------------------------------

mod dispatcher;
mod event_bus;
mod event_types;
mod handlers;

#[cfg(test)]
mod tests;

// Re-exports
pub use dispatcher::MessageDispatcher;
pub use event_bus::EventBus;
pub use event_types::{EventError, EventResult};
pub use handlers::{EventLogger, LoggingListener, TopicListener};
