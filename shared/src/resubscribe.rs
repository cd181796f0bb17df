//! Subscription registry and resubscription after session loss
//!
//! Every subscription the process makes is recorded here with its delivery
//! sink. When the broker comes back without our session, all recorded topics
//! are requested again in one subscribe request and the outcome is checked on
//! a separate task, so the delivery path never waits for the SUBACK.

use crate::broker::{BrokerError, Delivery, QoS, SharedBroker, SubscribeResult};
use crate::topics;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The broker declined a topic we were subscribed to before reconnecting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Server rejected resubscribe to topic: {topic}")]
pub struct ResubscriptionRejected {
    pub topic: String,
}

/// How a resubscribe request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResubscribeOutcome {
    /// Every topic was granted
    Restored { topics: usize },
    /// At least one topic was rejected
    Rejected(ResubscriptionRejected),
    /// The acknowledgement never arrived (connection dropped again)
    Lost,
}

/// An active subscription and the sink its messages go to
#[derive(Debug)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub qos: QoS,
    sink: mpsc::UnboundedSender<Delivery>,
}

impl SubscriptionRecord {
    pub fn new(topic: impl Into<String>, qos: QoS, sink: mpsc::UnboundedSender<Delivery>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            sink,
        }
    }

    /// Hand a message to the subscriber; false if it went away
    fn deliver(&self, delivery: Delivery) -> bool {
        self.sink.send(delivery).is_ok()
    }
}

/// Subscription records keyed by topic filter
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    records: HashMap<String, SubscriptionRecord>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, replacing any previous one for the same topic
    pub fn insert(&mut self, record: SubscriptionRecord) -> Option<SubscriptionRecord> {
        self.records.insert(record.topic.clone(), record)
    }

    pub fn remove(&mut self, topic: &str) -> Option<SubscriptionRecord> {
        self.records.remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.records.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Topic filters with their requested QoS
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.records
            .values()
            .map(|record| (record.topic.clone(), record.qos))
            .collect()
    }

    /// Deliver to every record whose filter matches; returns the number of sinks reached
    pub fn route(&self, delivery: &Delivery) -> usize {
        self.records
            .values()
            .filter(|record| topics::matches(&record.topic, &delivery.topic))
            .filter(|record| record.deliver(delivery.clone()))
            .count()
    }
}

/// Keeps subscriptions alive across broker-side session loss
pub struct ResubscriptionManager {
    broker: SharedBroker,
    registry: Arc<Mutex<SubscriptionRegistry>>,
}

impl ResubscriptionManager {
    pub fn new(broker: SharedBroker) -> Self {
        Self {
            broker,
            registry: Arc::new(Mutex::new(SubscriptionRegistry::new())),
        }
    }

    /// Subscribe to `topic` and wait for the broker's grant
    ///
    /// Meant for setup code; the delivery path never calls this. The record is
    /// registered before the request goes out so that messages arriving right
    /// after the SUBACK are routed.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<(QoS, mpsc::UnboundedReceiver<Delivery>), BrokerError> {
        let (sink, deliveries) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .await
            .insert(SubscriptionRecord::new(topic, qos, sink));

        let granted = match self.request_grant(topic, qos).await {
            Ok(granted) => granted,
            Err(e) => {
                self.registry.lock().await.remove(topic);
                return Err(e);
            }
        };

        info!("Subscribed to '{}' with {:?}", topic, granted);
        Ok((granted, deliveries))
    }

    async fn request_grant(&self, topic: &str, qos: QoS) -> Result<QoS, BrokerError> {
        let pending = self.broker.subscribe(vec![(topic.to_string(), qos)]).await?;
        let results = pending.await.map_err(|_| BrokerError::Closed)?;

        results
            .into_iter()
            .find(|result| result.topic == topic)
            .and_then(|result| result.granted)
            .ok_or_else(|| BrokerError::SubscribeRejected {
                topic: topic.to_string(),
            })
    }

    /// Drop a subscription locally and on the broker
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.registry.lock().await.remove(topic);
        self.broker.unsubscribe(topic).await
    }

    /// Route an inbound message to its subscribers
    pub async fn route(&self, delivery: &Delivery) -> usize {
        self.registry.lock().await.route(delivery)
    }

    /// Registered topic filters, sorted
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .registry
            .lock()
            .await
            .filters()
            .into_iter()
            .map(|(topic, _)| topic)
            .collect();
        topics.sort();
        topics
    }

    /// React to a resumed connection
    ///
    /// With a persisted session the broker still has our subscriptions.
    /// Otherwise every registered topic is requested again in one request,
    /// and the returned task evaluates the SUBACK when it arrives. `Ok(None)`
    /// means nothing had to be requested.
    pub async fn on_connection_resumed(
        &self,
        session_present: bool,
    ) -> Result<Option<JoinHandle<ResubscribeOutcome>>, BrokerError> {
        if session_present {
            info!("[RESUB] Session persisted, subscriptions kept by broker");
            return Ok(None);
        }

        let filters = self.registry.lock().await.filters();
        if filters.is_empty() {
            return Ok(None);
        }

        info!(
            "[RESUB] Session did not persist. Resubscribing to {} existing topic(s)...",
            filters.len()
        );

        let pending = self.broker.subscribe(filters).await?;

        Ok(Some(tokio::spawn(async move {
            match pending.await {
                Ok(results) => {
                    info!("[RESUB] Resubscribe results: {:?}", results);
                    match Self::on_resubscribe_complete(&results) {
                        Ok(()) => ResubscribeOutcome::Restored {
                            topics: results.len(),
                        },
                        Err(rejected) => ResubscribeOutcome::Rejected(rejected),
                    }
                }
                Err(_) => {
                    warn!("[RESUB] Resubscribe acknowledgement lost; retrying on next resume");
                    ResubscribeOutcome::Lost
                }
            }
        })))
    }

    /// Check a resubscribe result set; any topic without a granted QoS is fatal
    pub fn on_resubscribe_complete(
        results: &[SubscribeResult],
    ) -> Result<(), ResubscriptionRejected> {
        let mut first_rejected = None;

        for result in results.iter().filter(|r| r.granted.is_none()) {
            error!("[RESUB] Server rejected resubscribe to topic: {}", result.topic);
            first_rejected.get_or_insert_with(|| ResubscriptionRejected {
                topic: result.topic.clone(),
            });
        }

        match first_rejected {
            Some(rejected) => Err(rejected),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LoopbackHub;

    fn result(topic: &str, granted: Option<QoS>) -> SubscribeResult {
        SubscribeResult {
            topic: topic.into(),
            granted,
        }
    }

    #[test]
    fn test_registry_routes_by_filter() {
        let mut registry = SubscriptionRegistry::new();
        let (tx_all, mut rx_all) = mpsc::unbounded_channel();
        let (tx_one, mut rx_one) = mpsc::unbounded_channel();

        registry.insert(SubscriptionRecord::new("robots/+/process_order", QoS::AtMostOnce, tx_all));
        registry.insert(SubscriptionRecord::new("robots/r2/process_order", QoS::AtMostOnce, tx_one));

        let reached = registry.route(&Delivery::new("robots/r1/process_order", "{}"));
        assert_eq!(reached, 1);
        assert!(rx_all.try_recv().is_ok());
        assert!(rx_one.try_recv().is_err());

        assert_eq!(registry.route(&Delivery::new("robots/r2/process_order", "{}")), 2);
        assert_eq!(registry.route(&Delivery::new("elsewhere", "{}")), 0);
    }

    #[test]
    fn test_registry_topic_is_unique_key() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry
            .insert(SubscriptionRecord::new("a", QoS::AtMostOnce, tx.clone()))
            .is_none());
        assert!(registry
            .insert(SubscriptionRecord::new("a", QoS::AtLeastOnce, tx))
            .is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.filters(), vec![("a".to_string(), QoS::AtLeastOnce)]);
    }

    #[test]
    fn test_resubscribe_complete_accepts_full_grant() {
        let results = [result("a", Some(QoS::AtMostOnce)), result("b", Some(QoS::AtLeastOnce))];
        assert!(ResubscriptionManager::on_resubscribe_complete(&results).is_ok());
    }

    #[test]
    fn test_resubscribe_complete_rejects_null_grant() {
        let results = [result("a", Some(QoS::AtMostOnce)), result("b", None)];
        assert_eq!(
            ResubscriptionManager::on_resubscribe_complete(&results),
            Err(ResubscriptionRejected { topic: "b".into() })
        );
    }

    #[tokio::test]
    async fn test_every_topic_resubscribed_exactly_once() {
        let hub = LoopbackHub::new();
        let (broker, _events) = hub.connect("unit").await;
        let manager = ResubscriptionManager::new(Arc::new(broker));

        let topics = ["a/1", "b/+", "c/#"];
        for topic in topics {
            manager.subscribe(topic, QoS::AtMostOnce).await.unwrap();
        }

        hub.interrupt("unit").await;
        hub.resume("unit", false).await;

        let outcome = manager
            .on_connection_resumed(false)
            .await
            .unwrap()
            .expect("resubscribe issued")
            .await
            .unwrap();
        assert_eq!(outcome, ResubscribeOutcome::Restored { topics: 3 });

        for topic in topics {
            // One initial subscribe plus exactly one resubscribe
            assert_eq!(hub.subscribe_attempts(topic).await, 2, "{}", topic);
        }
        assert_eq!(hub.subscriptions("unit").await.len(), 3);
    }

    #[tokio::test]
    async fn test_persisted_session_needs_no_resubscribe() {
        let hub = LoopbackHub::new();
        let (broker, _events) = hub.connect("unit").await;
        let manager = ResubscriptionManager::new(Arc::new(broker));
        manager.subscribe("a", QoS::AtMostOnce).await.unwrap();

        assert!(manager.on_connection_resumed(true).await.unwrap().is_none());
        assert_eq!(hub.subscribe_attempts("a").await, 1);
    }

    #[tokio::test]
    async fn test_rejected_resubscribe_outcome() {
        let hub = LoopbackHub::new();
        let (broker, _events) = hub.connect("unit").await;
        let manager = ResubscriptionManager::new(Arc::new(broker));
        manager.subscribe("a", QoS::AtMostOnce).await.unwrap();
        manager.subscribe("b", QoS::AtMostOnce).await.unwrap();

        hub.reject("b").await;
        let outcome = manager
            .on_connection_resumed(false)
            .await
            .unwrap()
            .unwrap()
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ResubscribeOutcome::Rejected(ResubscriptionRejected { topic: "b".into() })
        );
    }

    #[tokio::test]
    async fn test_rejected_initial_subscribe_not_registered() {
        let hub = LoopbackHub::new();
        hub.reject("a").await;
        let (broker, _events) = hub.connect("unit").await;
        let manager = ResubscriptionManager::new(Arc::new(broker));

        let err = manager.subscribe("a", QoS::AtMostOnce).await.unwrap_err();
        assert!(matches!(err, BrokerError::SubscribeRejected { .. }));
        assert!(manager.topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_forgets_topic() {
        let hub = LoopbackHub::new();
        let (broker, _events) = hub.connect("unit").await;
        let manager = ResubscriptionManager::new(Arc::new(broker));
        manager.subscribe("a", QoS::AtMostOnce).await.unwrap();
        manager.subscribe("b", QoS::AtMostOnce).await.unwrap();

        manager.unsubscribe("a").await.unwrap();
        assert_eq!(manager.topics().await, vec!["b".to_string()]);
        assert_eq!(hub.subscriptions("unit").await, vec!["b".to_string()]);
    }
}
