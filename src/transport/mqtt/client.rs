//! Broker session ownership and supervision
//!
//! [`MqttListener`] owns the one authenticated session to the broker. A
//! background supervisor task polls the event loop, re-applies the
//! subscription after every (re)connect, forwards deliveries to the dispatch
//! channel, and reconnects forever under the backoff policy on any detected
//! disconnect.

use super::connection::{
    configure_mqtt_options, ConnectError, ConnectionState, ReconnectPolicy, ReconnectState,
    SubscribeError, CONNECT_TIMEOUT, OPERATION_TIMEOUT,
};
use super::message_handler::{route_mqtt_event, EventRoute, InboundMessage, MessageForwarder};
use crate::config::{SubscribeQos, SubscriptionSpec, TransportConfig};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Request-channel depth handed to rumqttc.
const CLIENT_CHANNEL_CAPACITY: usize = 10;

/// Offline-queue draining rate: one publish per tick, 2 per second.
const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// A publish accepted while the session was down, awaiting the
/// post-reconnect drain.
#[derive(Debug, Clone)]
struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
}

fn to_qos(qos: SubscribeQos) -> QoS {
    match qos {
        SubscribeQos::AtMostOnce => QoS::AtMostOnce,
        SubscribeQos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// Owns the broker session. Created once per process; the subscription is
/// fixed at construction and re-applied on every reconnect.
pub struct MqttListener {
    config: TransportConfig,
    subscription: SubscriptionSpec,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<EventLoop>,
    supervisor_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    forwarder: Arc<MessageForwarder>,
    offline_queue: Arc<Mutex<VecDeque<QueuedPublish>>>,
    draining: Arc<AtomicBool>,
}

impl MqttListener {
    /// Build the client for the configured broker. Reads the TLS material,
    /// so the credential files must already have passed validation.
    ///
    /// Delivered messages are handed off through `message_tx`.
    pub fn new(
        config: TransportConfig,
        subscription: SubscriptionSpec,
        message_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<Self, ConnectError> {
        let mqtt_options = configure_mqtt_options(&config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, CLIENT_CHANNEL_CAPACITY);

        Ok(MqttListener {
            config,
            subscription,
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(event_loop),
            supervisor_handle: None,
            state_rx: None,
            shutdown_tx: None,
            forwarder: Arc::new(MessageForwarder::new(message_tx)),
            offline_queue: Arc::new(Mutex::new(VecDeque::new())),
            draining: Arc::new(AtomicBool::new(false)),
        })
    }

    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        (
            watch::channel(ConnectionState::Connecting),
            watch::channel(false),
        )
    }

    /// Wait until the supervisor reports a confirmed session (ConnAck), a
    /// failure, or the timeout elapses.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        wait: Duration,
    ) -> Result<(), ConnectError> {
        let result = timeout(wait, async {
            loop {
                {
                    let state = state_rx.borrow();
                    match &*state {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Disconnected(reason) => {
                            return Err(ConnectError::Network(reason.clone()));
                        }
                        ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                    }
                }
                if state_rx.changed().await.is_err() {
                    return Err(ConnectError::Network(
                        "connection supervisor stopped".to_string(),
                    ));
                }
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ConnectError::Timeout(wait)),
        }
    }

    /// Sleep for `delay`, returning early with `false` if shutdown is
    /// signalled in the meantime.
    async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Issue the SUBSCRIBE for the fixed subscription, bounded by the
    /// per-operation timeout.
    async fn apply_subscription(
        client: &Arc<Mutex<AsyncClient>>,
        spec: &SubscriptionSpec,
    ) -> Result<(), SubscribeError> {
        let client = client.lock().await;
        match timeout(
            OPERATION_TIMEOUT,
            client.subscribe(&spec.topic_filter, to_qos(spec.qos)),
        )
        .await
        {
            Ok(Ok(_)) => {
                info!(topic = %spec.topic_filter, "subscription applied");
                Ok(())
            }
            Ok(Err(e)) => Err(SubscribeError::Request {
                topic: spec.topic_filter.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(SubscribeError::Timeout {
                topic: spec.topic_filter.clone(),
                timeout: OPERATION_TIMEOUT,
            }),
        }
    }

    /// Wait out the backoff, then swap in a fresh client and event loop for
    /// the next attempt. Returns `false` when shutdown was requested.
    #[allow(clippy::too_many_arguments)]
    async fn backoff_and_reconnect(
        reconnect: &mut ReconnectState,
        policy: &ReconnectPolicy,
        shutdown_rx: &mut watch::Receiver<bool>,
        state_tx: &watch::Sender<ConnectionState>,
        config: &TransportConfig,
        shared_client: &Arc<Mutex<AsyncClient>>,
        event_loop: &mut EventLoop,
    ) -> bool {
        let delay = reconnect.record_failure(policy);
        let attempt = reconnect.consecutive_failures;
        let _ = state_tx.send(ConnectionState::Reconnecting(attempt));
        info!(
            attempt,
            backoff_secs = delay.as_secs(),
            "scheduling reconnect attempt"
        );

        if !Self::interruptible_sleep(shutdown_rx, delay).await {
            info!("shutdown requested during reconnect backoff");
            return false;
        }
        if *shutdown_rx.borrow() {
            return false;
        }

        match configure_mqtt_options(config) {
            Ok(options) => {
                let (new_client, new_event_loop) =
                    AsyncClient::new(options, CLIENT_CHANNEL_CAPACITY);
                *event_loop = new_event_loop;
                *shared_client.lock().await = new_client;
                true
            }
            Err(e) => {
                // The stale event loop errors on the next poll, which lands
                // back here with a longer backoff.
                error!(error = %e, "failed to prepare reconnect attempt");
                true
            }
        }
    }

    /// Start draining queued publishes at the fixed rate. A no-op if a drain
    /// task is already running.
    fn spawn_queue_drain(
        client: Arc<Mutex<AsyncClient>>,
        queue: Arc<Mutex<VecDeque<QueuedPublish>>>,
        draining: Arc<AtomicBool>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        if draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DRAIN_INTERVAL);
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let next = { queue.lock().await.pop_front() };
                let Some(publish) = next else { break };

                interval.tick().await;

                let client = client.lock().await;
                let sent = timeout(
                    OPERATION_TIMEOUT,
                    client.publish(
                        &publish.topic,
                        publish.qos,
                        publish.retain,
                        publish.payload.clone(),
                    ),
                )
                .await;
                drop(client);

                match sent {
                    Ok(Ok(_)) => debug!(topic = %publish.topic, "drained queued publish"),
                    _ => {
                        // Session went down again; keep the message for the
                        // drain that follows the next reconnect.
                        warn!(topic = %publish.topic, "requeueing publish after failed drain");
                        queue.lock().await.push_front(publish);
                        break;
                    }
                }
            }
            draining.store(false, Ordering::SeqCst);
        });
    }

    /// Connect to the broker and start the connection supervisor.
    ///
    /// Succeeds only once the broker acknowledges the session (ConnAck),
    /// bounded by [`CONNECT_TIMEOUT`]. The primitive itself does not retry,
    /// but the supervisor spawned here keeps retrying in the background
    /// under the backoff policy even when this returns an error.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let mut event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| ConnectError::Network("event loop already started".to_string()))?;

        let ((state_tx, state_rx), (shutdown_tx, mut shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let config = self.config.clone();
        let subscription = self.subscription.clone();
        let shared_client = self.client.clone();
        let forwarder = self.forwarder.clone();
        let offline_queue = self.offline_queue.clone();
        let draining = self.draining.clone();

        let handle = tokio::spawn(async move {
            info!(client_id = %config.client_id, "starting connection supervisor");
            let policy = ReconnectPolicy::default();
            let mut reconnect = ReconnectState::default();

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("shutdown signal received, stopping connection supervisor");
                            break;
                        }
                    }

                    event = event_loop.poll() => {
                        match event {
                            Ok(event) => match route_mqtt_event(&event) {
                                EventRoute::ConnectionAcknowledged => {
                                    reconnect.record_success();
                                    info!(host = %config.host, port = config.port, "connected to broker");

                                    // The subscription must be back in place
                                    // before anything from this session is
                                    // treated as delivered.
                                    match Self::apply_subscription(&shared_client, &subscription).await {
                                        Ok(()) => {
                                            let _ = state_tx.send(ConnectionState::Connected);
                                            Self::spawn_queue_drain(
                                                shared_client.clone(),
                                                offline_queue.clone(),
                                                draining.clone(),
                                                shutdown_rx.clone(),
                                            );
                                        }
                                        Err(e) => {
                                            warn!(error = %e, "subscription failed, tearing session down");
                                            let _ = state_tx.send(ConnectionState::Disconnected(e.to_string()));
                                            if !Self::backoff_and_reconnect(
                                                &mut reconnect, &policy, &mut shutdown_rx,
                                                &state_tx, &config, &shared_client, &mut event_loop,
                                            ).await {
                                                break;
                                            }
                                        }
                                    }
                                }
                                EventRoute::MessageReceived(message) => {
                                    info!(topic = %message.topic, bytes = message.payload.len(), "message received");
                                    forwarder.forward(message).await;
                                }
                                EventRoute::Disconnected => {
                                    warn!("broker closed the session");
                                    let _ = state_tx.send(ConnectionState::Disconnected(
                                        "broker closed the session".to_string(),
                                    ));
                                    if !Self::backoff_and_reconnect(
                                        &mut reconnect, &policy, &mut shutdown_rx,
                                        &state_tx, &config, &shared_client, &mut event_loop,
                                    ).await {
                                        break;
                                    }
                                }
                                EventRoute::SubscriptionConfirmed { codes } => {
                                    debug!(codes = %codes, "subscription confirmed by broker");
                                }
                                EventRoute::InfrastructureEvent(event) => {
                                    debug!(target: "mqtt_transport", event = %event, "protocol event");
                                }
                                EventRoute::OutgoingEvent => {}
                            },
                            Err(e) => {
                                warn!(error = %e, "connection lost");
                                let _ = state_tx.send(ConnectionState::Disconnected(e.to_string()));
                                if !Self::backoff_and_reconnect(
                                    &mut reconnect, &policy, &mut shutdown_rx,
                                    &state_tx, &config, &shared_client, &mut event_loop,
                                ).await {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            info!("connection supervisor stopped");
        });

        self.supervisor_handle = Some(handle);

        Self::wait_for_connection_confirmation(state_rx, CONNECT_TIMEOUT).await
    }

    /// Publish on the optional outbound path.
    ///
    /// Queued (without bound) while the session is down, and on a failed or
    /// timed-out direct publish; queued messages are drained at a fixed rate
    /// once the session is re-established. A stalled direct publish also
    /// means the event loop has stopped making progress, so the supervisor's
    /// reconnect path fires on its own.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: SubscribeQos, retain: bool) {
        let qos = to_qos(qos);
        let connected = self
            .state_rx
            .as_ref()
            .map(|rx| rx.borrow().is_connected())
            .unwrap_or(false);

        if !connected {
            debug!(topic, "session down - queueing publish");
            self.offline_queue.lock().await.push_back(QueuedPublish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            return;
        }

        let client = self.client.lock().await;
        let sent = timeout(
            OPERATION_TIMEOUT,
            client.publish(topic, qos, retain, payload.clone()),
        )
        .await;
        drop(client);

        match sent {
            Ok(Ok(_)) => debug!(topic, "published"),
            Ok(Err(e)) => {
                warn!(topic, error = %e, "publish failed, queueing for redelivery");
                self.offline_queue.lock().await.push_back(QueuedPublish {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain,
                });
            }
            Err(_) => {
                warn!(topic, "publish timed out, queueing for redelivery");
                self.offline_queue.lock().await.push_back(QueuedPublish {
                    topic: topic.to_string(),
                    payload,
                    qos,
                    retain,
                });
            }
        }
    }

    /// Best-effort graceful disconnect, bounded by [`CONNECT_TIMEOUT`].
    pub async fn disconnect(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        {
            let client = self.client.lock().await;
            match timeout(CONNECT_TIMEOUT, client.disconnect()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(error = %e, "disconnect request failed"),
                Err(_) => warn!("disconnect request timed out"),
            }
        }

        if let Some(handle) = self.supervisor_handle.take() {
            match timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("connection supervisor shut down cleanly"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "connection supervisor ended with error");
                }
                Err(_) => warn!("connection supervisor did not stop in time, aborting"),
                _ => {}
            }
        }

        info!("disconnected from broker");
    }

    /// Current connection state, `None` before `connect()`.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    /// Number of publishes waiting for the post-reconnect drain.
    pub async fn queued_publishes(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

impl Drop for MqttListener {
    fn drop(&mut self) {
        // Can't run async teardown here; disconnect() is the graceful path.
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.supervisor_handle.take() {
            handle.abort();
        }
    }
}
