//! Observability: structured logging for the listener.

pub mod logging;

pub use logging::{init_listener_logging, init_logging, LogFormat};
