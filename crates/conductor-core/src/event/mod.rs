//! Event bus for workflow lifecycle and node transition events.
//!
//! Provides an `EventBus` that distributes `EngineEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
