//! MQTT broker client with persistent sessions and automatic reconnection

use super::{
    BrokerClient, BrokerError, ConnectionEvent, ConnectionLifecycle, Delivery, PendingSubAck,
    QoS, SubscribeResult,
};
use crate::timing;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeFilter,
    SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Certificate files for mutual TLS
#[derive(Debug, Clone)]
pub struct TlsFiles {
    /// Root CA the broker certificate chains to
    pub root_ca: PathBuf,
    /// Client certificate (PEM)
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub key: Option<PathBuf>,
}

/// Configuration for the MQTT broker client
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker host name, without port
    pub endpoint: String,
    /// Broker port
    pub port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// TLS material; plain TCP when absent
    pub tls: Option<TlsFiles>,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Start a fresh session on every connect
    pub clean_session: bool,
    /// Time to wait for the initial CONNACK
    pub connect_timeout: Duration,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Capacity of the connection event channel
    pub event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost".into(),
            port: timing::DEFAULT_PORT,
            client_id: "kitchen-client".into(),
            tls: None,
            keep_alive: Duration::from_secs(timing::KEEP_ALIVE_SECS),
            clean_session: false,
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            reconnect_delay: Duration::from_millis(timing::RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(timing::MAX_RECONNECT_DELAY_MS),
            event_capacity: 100,
        }
    }
}

impl BrokerConfig {
    /// Build rumqttc options, loading certificates from disk
    async fn mqtt_options(&self) -> Result<MqttOptions, BrokerError> {
        let mut options = MqttOptions::new(&self.client_id, &self.endpoint, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(self.clean_session);

        if let Some(tls) = &self.tls {
            let ca = read_pem(&tls.root_ca).await?;
            let client_auth = match (&tls.cert, &tls.key) {
                (Some(cert), Some(key)) => Some((read_pem(cert).await?, read_pem(key).await?)),
                (None, None) => None,
                _ => {
                    return Err(BrokerError::Tls(
                        "client certificate and key must be given together".into(),
                    ))
                }
            };
            options.set_transport(Transport::tls(ca, client_auth, None));
        }

        Ok(options)
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, BrokerError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| BrokerError::Tls(format!("{}: {}", path.display(), e)))
}

/// A subscribe request waiting for its SUBACK
struct PendingRequest {
    topics: Vec<String>,
    reply: oneshot::Sender<Vec<SubscribeResult>>,
}

/// Correlates subscribe requests with the broker's acknowledgements
///
/// Requests are queued in the order they are handed to the client. The event
/// loop sends them in the same order, so each `Outgoing::Subscribe(pkid)`
/// belongs to the oldest queued request.
#[derive(Default)]
struct SubAckTracker {
    queued: VecDeque<PendingRequest>,
    in_flight: HashMap<u16, PendingRequest>,
}

impl SubAckTracker {
    fn enqueue(&mut self, topics: Vec<String>, reply: oneshot::Sender<Vec<SubscribeResult>>) {
        self.queued.push_back(PendingRequest { topics, reply });
    }

    /// Forget the most recent request; it never reached the event loop
    fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    fn on_outgoing(&mut self, pkid: u16) {
        if let Some(request) = self.queued.pop_front() {
            self.in_flight.insert(pkid, request);
        }
    }

    /// Resolve the request acknowledged by `pkid`; false if it is unknown
    fn on_suback(&mut self, pkid: u16, return_codes: &[SubscribeReasonCode]) -> bool {
        let Some(request) = self.in_flight.remove(&pkid) else {
            return false;
        };

        let results = request
            .topics
            .into_iter()
            .enumerate()
            .map(|(i, topic)| {
                let granted = match return_codes.get(i) {
                    Some(SubscribeReasonCode::Success(qos)) => Some(QoS::from(*qos)),
                    _ => None,
                };
                SubscribeResult { topic, granted }
            })
            .collect();

        // Requester may have given up waiting
        let _ = request.reply.send(results);
        true
    }

    /// Drop requests whose SUBACK can no longer arrive
    fn on_interrupted(&mut self) -> usize {
        let lost = self.in_flight.len();
        self.in_flight.clear();
        lost
    }
}

/// Broker client backed by rumqttc
pub struct MqttBroker {
    client: AsyncClient,
    acks: Arc<Mutex<SubAckTracker>>,
    /// Keeps tracker order and client request order identical
    subscribe_order: Mutex<()>,
}

impl MqttBroker {
    /// Connect to the broker and start the event loop
    ///
    /// Returns once the broker acknowledged the connection, together with the
    /// receiver for all subsequent connection events.
    pub async fn connect(
        config: &BrokerConfig,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), BrokerError> {
        let options = config.mqtt_options().await?;
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let mut lifecycle = ConnectionLifecycle::new();
        lifecycle.on_connecting();

        info!(
            "Connecting to {}:{} with client ID '{}'...",
            config.endpoint, config.port, config.client_id
        );

        let session_present = match timeout(config.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BrokerError::Connect(format!(
                    "no CONNACK from {} within {:?}",
                    config.endpoint, config.connect_timeout
                )))
            }
        };

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        if let Some(event) = lifecycle.on_connack(session_present) {
            event_tx.send(event).await.map_err(|_| BrokerError::Closed)?;
        }

        let acks = Arc::new(Mutex::new(SubAckTracker::default()));
        tokio::spawn(event_loop(
            eventloop,
            lifecycle,
            acks.clone(),
            event_tx,
            config.clone(),
        ));

        Ok((
            Self {
                client,
                acks,
                subscribe_order: Mutex::new(()),
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .publish_bytes(topic, qos.into(), false, payload)
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }

    async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<PendingSubAck, BrokerError> {
        let (reply, pending) = oneshot::channel();
        let topics = filters.iter().map(|(topic, _)| topic.clone()).collect();
        let filters = filters
            .into_iter()
            .map(|(topic, qos)| SubscribeFilter::new(topic, qos.into()));

        let _order = self.subscribe_order.lock().await;
        self.acks.lock().await.enqueue(topics, reply);

        if let Err(e) = self.client.subscribe_many(filters).await {
            self.acks.lock().await.cancel_last();
            return Err(BrokerError::Request(e.to_string()));
        }

        Ok(pending)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }
}

/// Poll until the broker accepts the connection
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<bool, BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack.session_present),
            Ok(_) => {}
            Err(e) => return Err(BrokerError::Connect(e.to_string())),
        }
    }
}

/// Main event loop with reconnection logic
///
/// rumqttc reconnects on the next `poll` after an error; this loop only adds
/// the backoff and translates packets into connection events.
async fn event_loop(
    mut eventloop: EventLoop,
    mut lifecycle: ConnectionLifecycle,
    acks: Arc<Mutex<SubAckTracker>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    config: BrokerConfig,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                reconnect_delay = config.reconnect_delay; // Reset delay
                lifecycle.on_connack(ack.session_present)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(ConnectionEvent::Message(
                Delivery::new(publish.topic, publish.payload),
            )),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if !acks.lock().await.on_suback(ack.pkid, &ack.return_codes) {
                    debug!("SUBACK for unknown packet {}", ack.pkid);
                }
                None
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.lock().await.on_outgoing(pkid);
                None
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                if let Some(event) = lifecycle.on_disconnect() {
                    let _ = event_tx.send(event).await;
                }
                break;
            }
            Ok(_) => None,
            Err(e) => {
                let event = lifecycle.on_error(e.to_string());
                if event.is_some() {
                    let lost = acks.lock().await.on_interrupted();
                    if lost > 0 {
                        warn!("{} subscribe request(s) lost with the connection", lost);
                    }
                }

                if let Some(event) = event {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }

                // Wait before reconnecting
                tokio::time::sleep(reconnect_delay).await;

                // Exponential backoff
                reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
                continue;
            }
        };

        if let Some(event) = event {
            if event_tx.send(event).await.is_err() {
                // Nobody is listening anymore
                break;
            }
        }
    }

    info!("MQTT event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.port, 8883);
        assert_eq!(config.keep_alive, Duration::from_secs(6));
        assert!(!config.clean_session);
        assert!(config.tls.is_none());
    }

    #[tokio::test]
    async fn test_unreadable_ca_is_tls_error() {
        let config = BrokerConfig {
            tls: Some(TlsFiles {
                root_ca: PathBuf::from("/nonexistent/root-ca.pem"),
                cert: None,
                key: None,
            }),
            ..Default::default()
        };
        assert!(matches!(config.mqtt_options().await, Err(BrokerError::Tls(_))));
    }

    fn local_config(port: u16) -> BrokerConfig {
        BrokerConfig {
            endpoint: "127.0.0.1".into(),
            port,
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        // Bind and release a port so nothing listens on it
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = MqttBroker::connect(&local_config(port)).await;
        assert!(matches!(result, Err(BrokerError::Connect(_))));
    }

    #[tokio::test]
    async fn test_missing_connack_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accept and stay silent
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let result = MqttBroker::connect(&local_config(port)).await;
        match result {
            Err(BrokerError::Connect(reason)) => assert!(reason.contains("no CONNACK")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected without a CONNACK"),
        }

        server.abort();
    }

    #[test]
    fn test_suback_correlation() {
        let mut tracker = SubAckTracker::default();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();

        tracker.enqueue(vec!["a/1".into()], tx_a);
        tracker.enqueue(vec!["b/1".into(), "b/2".into()], tx_b);

        tracker.on_outgoing(7);
        tracker.on_outgoing(8);

        let codes = [
            SubscribeReasonCode::Success(rumqttc::QoS::AtMostOnce),
            SubscribeReasonCode::Failure,
        ];
        assert!(tracker.on_suback(8, &codes));

        let results = rx_b.try_recv().expect("b resolved");
        assert_eq!(results[0].granted, Some(QoS::AtMostOnce));
        assert_eq!(results[1].topic, "b/2");
        assert_eq!(results[1].granted, None);

        // `a` is still waiting
        assert!(rx_a.try_recv().is_err());
        assert!(!tracker.on_suback(99, &codes));
    }

    #[test]
    fn test_interruption_drops_in_flight_requests() {
        let mut tracker = SubAckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        tracker.enqueue(vec!["a".into()], tx);
        tracker.on_outgoing(1);

        assert_eq!(tracker.on_interrupted(), 1);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_missing_return_code_counts_as_rejected() {
        let mut tracker = SubAckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        tracker.enqueue(vec!["a".into(), "b".into()], tx);
        tracker.on_outgoing(3);
        tracker.on_suback(3, &[SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce)]);

        let results = rx.try_recv().unwrap();
        assert_eq!(results[0].granted, Some(QoS::AtLeastOnce));
        assert_eq!(results[1].granted, None);
    }
}
