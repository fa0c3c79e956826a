//! Transport layer
//!
//! Owns the broker side of the bridge: session establishment, supervision,
//! and delivery hand-off to the dispatcher.

pub mod mqtt;

pub use mqtt::{InboundMessage, MqttListener};
