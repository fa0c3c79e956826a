//! MQTT transport implementation
//!
//! Split the way the rest of the transport layer is: `connection` holds the
//! pure state machine and option building, `message_handler` the pure event
//! routing, and `client` the impure session ownership and supervision.

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttListener;
pub use connection::{
    ConnectError, ConnectionState, ReconnectPolicy, ReconnectState, SubscribeError,
    CONNECT_TIMEOUT, OPERATION_TIMEOUT,
};
pub use message_handler::InboundMessage;
