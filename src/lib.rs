//! mqtt-exec - run a command for every message on an MQTT subscription
//!
//! An always-on bridge between an MQTT broker and local command execution:
//! the listener keeps one mutually-authenticated TLS session to a broker,
//! subscribes to a topic filter, and invokes a configured shell command per
//! delivered message with `MQTT_TOPIC` and `MQTT_PAYLOAD` added to the
//! environment.
//!
//! The connection survives anything transient: disconnects re-enter an
//! exponential backoff loop (1 s doubling to a sustained 32 s ceiling) that
//! never gives up, and the subscription is re-applied after every reconnect
//! before deliveries resume. Command invocations are fire-and-forget per
//! message - a slow or failing command neither blocks later messages nor
//! touches the connection.
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_exec::config::{SubscribeQos, SubscriptionSpec, TransportConfig};
//! use mqtt_exec::dispatch::{Dispatcher, DISPATCH_QUEUE_DEPTH};
//! use mqtt_exec::transport::MqttListener;
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TransportConfig {
//!     client_id: "mqtt-listener".to_string(),
//!     host: "broker.example.com".to_string(),
//!     port: 8883,
//!     root_ca: "certs/root-ca.pem".into(),
//!     cert: "certs/device.pem.crt".into(),
//!     key: "certs/private.pem.key".into(),
//! };
//! let subscription = SubscriptionSpec {
//!     topic_filter: "iotbutton/#".to_string(),
//!     qos: SubscribeQos::AtLeastOnce,
//! };
//!
//! let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
//! let dispatcher = Dispatcher::new(Some("echo $MQTT_TOPIC $MQTT_PAYLOAD".to_string()));
//! let dispatch_loop = dispatcher.run(rx);
//!
//! let mut listener = MqttListener::new(transport, subscription, tx)?;
//! listener.connect().await?;
//! # let _ = dispatch_loop;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod observability;
pub mod transport;

pub use config::{ConfigError, ListenerConfig, SubscribeQos, SubscriptionSpec, TransportConfig};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use transport::{InboundMessage, MqttListener};
