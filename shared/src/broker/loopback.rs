//! In-process loopback broker
//!
//! Routes publishes between clients of the same hub without a network. It
//! also plays the shadow service: a publish to `$shadow/things/{thing}/update`
//! is echoed on `.../update/accepted`.
//!
//! Faults are injected through the hub: interrupting and resuming a client
//! (with or without its session) and rejecting topics on subscribe.

use super::{
    BrokerClient, BrokerError, ConnectionEvent, Delivery, PendingSubAck, QoS, SubscribeResult,
};
use crate::topics;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

/// Default capacity of each client's event channel
const EVENT_CAPACITY: usize = 1024;

struct ClientEntry {
    events: mpsc::Sender<ConnectionEvent>,
    subscriptions: HashMap<String, QoS>,
    connected: bool,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, ClientEntry>,
    rejected: HashSet<String>,
    published: Vec<Delivery>,
    subscribe_attempts: HashMap<String, usize>,
    shadow_service: bool,
}

impl HubState {
    /// Deliver to every connected client with a matching subscription
    fn route(&self, delivery: &Delivery) {
        for (client_id, entry) in &self.clients {
            if !entry.connected {
                continue;
            }

            let subscribed = entry
                .subscriptions
                .keys()
                .any(|filter| topics::matches(filter, &delivery.topic));

            // A full channel loses the message, as at-most-once allows
            if subscribed
                && entry
                    .events
                    .try_send(ConnectionEvent::Message(delivery.clone()))
                    .is_err()
            {
                debug!("Loopback dropped message on {} for {}", delivery.topic, client_id);
            }
        }
    }
}

/// Shared message hub; clone it to hand the same hub to several clients
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    /// Create a hub that emulates the shadow service
    pub fn new() -> Self {
        let state = HubState {
            shadow_service: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Create a hub that routes shadow updates verbatim only
    pub fn without_shadow_service() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
        }
    }

    /// Connect a client; a previous client with the same id is replaced
    pub async fn connect(
        &self,
        client_id: impl Into<String>,
    ) -> (LoopbackBroker, mpsc::Receiver<ConnectionEvent>) {
        let client_id = client_id.into();
        let (events, event_rx) = mpsc::channel(EVENT_CAPACITY);

        // Fresh channel, cannot be full
        let _ = events.try_send(ConnectionEvent::Connected {
            session_present: false,
        });

        self.state.lock().await.clients.insert(
            client_id.clone(),
            ClientEntry {
                events,
                subscriptions: HashMap::new(),
                connected: true,
            },
        );

        let broker = LoopbackBroker {
            hub: self.clone(),
            client_id,
        };
        (broker, event_rx)
    }

    /// Simulate a lost connection for `client_id`
    pub async fn interrupt(&self, client_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.clients.get_mut(client_id) {
            if entry.connected {
                entry.connected = false;
                let _ = entry.events.try_send(ConnectionEvent::Interrupted {
                    reason: "loopback interrupt".into(),
                });
            }
        }
    }

    /// Reconnect `client_id`; without a session its subscriptions are gone
    pub async fn resume(&self, client_id: &str, session_present: bool) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.clients.get_mut(client_id) {
            entry.connected = true;
            if !session_present {
                entry.subscriptions.clear();
            }
            let _ = entry
                .events
                .try_send(ConnectionEvent::Resumed { session_present });
        }
    }

    /// Reject subsequent subscribe requests for `topic`
    pub async fn reject(&self, topic: impl Into<String>) {
        self.state.lock().await.rejected.insert(topic.into());
    }

    /// Accept `topic` again
    pub async fn allow(&self, topic: &str) {
        self.state.lock().await.rejected.remove(topic);
    }

    /// Every publish accepted by the hub, in order
    pub async fn published(&self) -> Vec<Delivery> {
        self.state.lock().await.published.clone()
    }

    /// Payloads published on exactly `topic`, in order
    pub async fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|d| d.topic == topic)
            .map(|d| d.payload.clone())
            .collect()
    }

    /// How many times any client asked to subscribe to `topic`
    pub async fn subscribe_attempts(&self, topic: &str) -> usize {
        self.state
            .lock()
            .await
            .subscribe_attempts
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Filters `client_id` is currently subscribed to
    pub async fn subscriptions(&self, client_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut filters: Vec<String> = state
            .clients
            .get(client_id)
            .map(|entry| entry.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        filters.sort();
        filters
    }
}

/// Client handle of a [`LoopbackHub`]
pub struct LoopbackBroker {
    hub: LoopbackHub,
    client_id: String,
}

#[async_trait]
impl BrokerClient for LoopbackBroker {
    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS) -> Result<(), BrokerError> {
        let mut state = self.hub.state.lock().await;

        let connected = match state.clients.get(&self.client_id) {
            Some(entry) => entry.connected,
            None => return Err(BrokerError::Closed),
        };
        if !connected {
            // Lost while offline, no error at-most-once
            debug!("Loopback dropped publish on {} (client offline)", topic);
            return Ok(());
        }

        let delivery = Delivery::new(topic, payload);
        state.route(&delivery);
        state.published.push(delivery.clone());

        if state.shadow_service {
            if let Some(thing) = topics::thing_from_shadow_topic(topic) {
                if topic == topics::shadow_update(thing) {
                    let accepted = Delivery::new(topics::shadow_update_accepted(thing), delivery.payload);
                    state.route(&accepted);
                }
            }
        }

        Ok(())
    }

    async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<PendingSubAck, BrokerError> {
        let mut state = self.hub.state.lock().await;
        let HubState {
            clients,
            rejected,
            subscribe_attempts,
            ..
        } = &mut *state;

        let entry = clients
            .get_mut(&self.client_id)
            .filter(|entry| entry.connected)
            .ok_or(BrokerError::Closed)?;

        let results = filters
            .into_iter()
            .map(|(topic, qos)| {
                *subscribe_attempts.entry(topic.clone()).or_insert(0) += 1;

                let granted = if rejected.contains(&topic) {
                    None
                } else {
                    entry.subscriptions.insert(topic.clone(), qos);
                    Some(qos)
                };
                SubscribeResult { topic, granted }
            })
            .collect();

        let (reply, pending) = oneshot::channel();
        let _ = reply.send(results);
        Ok(pending)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.hub.state.lock().await;
        let entry = state
            .clients
            .get_mut(&self.client_id)
            .ok_or(BrokerError::Closed)?;
        entry.subscriptions.remove(topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        let mut state = self.hub.state.lock().await;
        let entry = state
            .clients
            .remove(&self.client_id)
            .ok_or(BrokerError::Closed)?;
        let _ = entry.events.try_send(ConnectionEvent::Disconnected);
        Ok(())
    }
}
