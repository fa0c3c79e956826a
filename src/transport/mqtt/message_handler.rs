//! Pure routing of MQTT events
//!
//! Maps rumqttc v5 events onto the small set of outcomes the connection
//! supervisor cares about, and forwards delivered messages into the dispatch
//! channel.

use rumqttc::v5::Event;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One message delivered by the broker.
///
/// Ownership moves into the dispatch channel and then into the per-message
/// invocation task; nothing is retained after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Concrete topic the message arrived on (wildcards expanded).
    pub topic: String,
    /// Raw payload bytes, untouched.
    pub payload: Vec<u8>,
}

/// Routing decisions for MQTT events.
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// ConnAck received - session is up, re-apply the subscription
    ConnectionAcknowledged,
    /// Message received on the subscription
    MessageReceived(InboundMessage),
    /// Broker closed the session
    Disconnected,
    /// SubAck received; reason codes rendered for the log
    SubscriptionConfirmed { codes: String },
    /// Protocol housekeeping (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event, handled by the event loop itself
    OutgoingEvent,
}

/// Route a polled MQTT event (pure function).
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => {
            use rumqttc::v5::mqttbytes::v5::Packet;
            match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                }),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    codes: format!("{:?}", suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            }
        }
        Event::Outgoing(_) => EventRoute::OutgoingEvent,
    }
}

/// Hands delivered messages from the event-loop task to the dispatch loop.
pub struct MessageForwarder {
    sender: mpsc::Sender<InboundMessage>,
}

impl MessageForwarder {
    pub fn new(sender: mpsc::Sender<InboundMessage>) -> Self {
        Self { sender }
    }

    /// Forward one delivery. The dispatch loop drains its channel promptly
    /// (each invocation runs in its own task), so this only blocks if the
    /// receiver has fallen severely behind.
    pub async fn forward(&self, message: InboundMessage) {
        debug!(topic = %message.topic, bytes = message.payload.len(), "forwarding message to dispatcher");
        if self.sender.send(message).await.is_err() {
            warn!("dispatch channel closed - message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Packet, Publish, SubAck,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged
        ));
    }

    #[test]
    fn test_route_disconnect() {
        let event = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(route_mqtt_event(&event), EventRoute::Disconnected));
    }

    #[test]
    fn test_route_publish_preserves_payload_bytes() {
        // Non-UTF-8 payload must come through byte-for-byte
        let payload: &[u8] = &[0x00, 0xff, 0xfe, b'c', b'l', b'i', b'c', b'k'];
        let event = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("devices/42/event"),
            pkid: 1,
            payload: Bytes::copy_from_slice(payload),
            properties: None,
        }));

        match route_mqtt_event(&event) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "devices/42/event");
                assert_eq!(message.payload, payload);
            }
            other => panic!("expected MessageReceived, got {other:?}"),
        }
    }

    #[test]
    fn test_route_suback() {
        let event = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 1,
            return_codes: vec![],
            properties: None,
        }));
        assert!(matches!(
            route_mqtt_event(&event),
            EventRoute::SubscriptionConfirmed { .. }
        ));
    }

    #[tokio::test]
    async fn test_forwarder_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let forwarder = MessageForwarder::new(tx);

        for n in 0..3u8 {
            forwarder
                .forward(InboundMessage {
                    topic: format!("t/{n}"),
                    payload: vec![n],
                })
                .await;
        }

        for n in 0..3u8 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.topic, format!("t/{n}"));
            assert_eq!(message.payload, vec![n]);
        }
    }

    #[tokio::test]
    async fn test_forwarder_absorbs_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let forwarder = MessageForwarder::new(tx);

        // Must not panic or error out of the event loop
        forwarder
            .forward(InboundMessage {
                topic: "t".to_string(),
                payload: b"p".to_vec(),
            })
            .await;
    }
}
