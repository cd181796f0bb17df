//! Session driver
//!
//! Consumes the broker's connection events on a single task: logs lifecycle
//! changes, restores subscriptions after session loss and routes inbound
//! messages to their subscribers.
//!
//! While a resubscribe is outstanding, inbound messages are held back. They
//! are released once every topic is confirmed, and never delivered if the
//! broker rejected one. A resubscribe that was never confirmed is issued
//! again on the next resume, even when the broker reports a persisted session.

use crate::broker::{BrokerError, ConnectionEvent, Delivery, QoS, SharedBroker};
use crate::resubscribe::{ResubscribeOutcome, ResubscriptionManager, ResubscriptionRejected};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A connected client together with its subscription bookkeeping
pub struct Session {
    broker: SharedBroker,
    manager: ResubscriptionManager,
    events: mpsc::Receiver<ConnectionEvent>,
}

impl Session {
    pub fn new(broker: SharedBroker, events: mpsc::Receiver<ConnectionEvent>) -> Self {
        Self {
            manager: ResubscriptionManager::new(broker.clone()),
            broker,
            events,
        }
    }

    /// Broker handle for publishing from role tasks
    pub fn broker(&self) -> SharedBroker {
        self.broker.clone()
    }

    /// Subscribe and return the receiver messages on `topic` are routed to
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        let (_granted, deliveries) = self.manager.subscribe(topic, qos).await?;
        Ok(deliveries)
    }

    /// Drive the connection until it is closed
    ///
    /// Returns `Ok` after a disconnect and `Err` when the broker rejected a
    /// resubscription; callers treat the latter as fatal.
    pub async fn run(mut self) -> Result<(), ResubscriptionRejected> {
        let mut resubscribing: Option<JoinHandle<ResubscribeOutcome>> = None;
        // Set from the moment subscriptions are known to be missing until a
        // resubscribe is confirmed
        let mut needs_resubscribe = false;
        let mut held: VecDeque<Delivery> = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                outcome = wait_outcome(&mut resubscribing) => {
                    resubscribing = None;
                    match outcome {
                        ResubscribeOutcome::Restored { topics } => {
                            info!("[SESSION] {} subscription(s) restored", topics);
                            needs_resubscribe = false;
                            while let Some(delivery) = held.pop_front() {
                                self.route(delivery).await;
                            }
                        }
                        ResubscribeOutcome::Rejected(rejected) => {
                            error!("[SESSION] {}", rejected);
                            return Err(rejected);
                        }
                        ResubscribeOutcome::Lost => {
                            debug!("[SESSION] Holding {} message(s) until next resubscribe", held.len());
                        }
                    }
                }

                event = self.events.recv() => match event {
                    Some(ConnectionEvent::Connected { session_present }) => {
                        info!("Connected! session_present: {}", session_present);
                    }
                    Some(ConnectionEvent::Interrupted { reason }) => {
                        warn!("Connection interrupted. error: {}", reason);
                    }
                    Some(ConnectionEvent::Resumed { session_present }) => {
                        info!("Connection resumed. session_present: {}", session_present);
                        if !session_present {
                            needs_resubscribe = true;
                        } else if needs_resubscribe {
                            warn!("[SESSION] Previous resubscribe unconfirmed, requesting again");
                        }

                        if needs_resubscribe {
                            match self.manager.on_connection_resumed(false).await {
                                Ok(Some(handle)) => {
                                    if let Some(previous) = resubscribing.replace(handle) {
                                        previous.abort();
                                    }
                                }
                                Ok(None) => {
                                    needs_resubscribe = false;
                                }
                                Err(e) => {
                                    warn!("[SESSION] Resubscribe request failed, retrying on next resume: {}", e);
                                }
                            }
                        }
                    }
                    Some(ConnectionEvent::Message(delivery)) => {
                        if needs_resubscribe || resubscribing.is_some() {
                            held.push_back(delivery);
                        } else {
                            self.route(delivery).await;
                        }
                    }
                    Some(ConnectionEvent::Disconnected) => {
                        info!("Disconnected!");
                        return Ok(());
                    }
                    None => {
                        warn!("[SESSION] Connection event channel closed");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn route(&self, delivery: Delivery) {
        if self.manager.route(&delivery).await == 0 {
            debug!("[SESSION] No subscriber for message on {}", delivery.topic);
        }
    }
}

/// Resolve the outstanding resubscribe, or never when there is none
async fn wait_outcome(pending: &mut Option<JoinHandle<ResubscribeOutcome>>) -> ResubscribeOutcome {
    match pending {
        Some(handle) => handle.await.unwrap_or(ResubscribeOutcome::Lost),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, LoopbackHub, PendingSubAck, SubscribeResult};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn connect(hub: &LoopbackHub, client_id: &str) -> Session {
        let (broker, events) = hub.connect(client_id).await;
        Session::new(Arc::new(broker), events)
    }

    #[tokio::test]
    async fn test_messages_routed_to_subscriber() {
        let hub = LoopbackHub::new();
        let session = connect(&hub, "sub").await;
        let mut deliveries = session.subscribe("orders/+", QoS::AtMostOnce).await.unwrap();
        let driver = tokio::spawn(session.run());

        let (publisher, _events) = hub.connect("pub").await;
        publisher
            .publish("orders/1", Bytes::from_static(b"hello"), QoS::AtMostOnce)
            .await
            .unwrap();

        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"hello"));

        driver.abort();
    }

    #[tokio::test]
    async fn test_session_loss_restores_delivery() {
        let hub = LoopbackHub::new();
        let session = connect(&hub, "sub").await;
        let mut deliveries = session.subscribe("a", QoS::AtMostOnce).await.unwrap();
        let driver = tokio::spawn(session.run());

        hub.interrupt("sub").await;
        hub.resume("sub", false).await;

        // Wait for the driver to resubscribe
        for _ in 0..100 {
            if hub.subscribe_attempts("a").await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hub.subscribe_attempts("a").await, 2);

        let (publisher, _events) = hub.connect("pub").await;
        publisher
            .publish("a", Bytes::from_static(b"after"), QoS::AtMostOnce)
            .await
            .unwrap();
        assert_eq!(deliveries.recv().await.unwrap().payload, Bytes::from_static(b"after"));

        driver.abort();
    }

    /// Broker whose SUBACKs are released by the test
    #[derive(Default)]
    struct ManualAckBroker {
        auto_grant: AtomicBool,
        fail_requests: AtomicBool,
        requests: AtomicUsize,
        waiting: StdMutex<Vec<(Vec<String>, oneshot::Sender<Vec<SubscribeResult>>)>>,
    }

    impl ManualAckBroker {
        fn granting() -> Self {
            let broker = Self::default();
            broker.auto_grant.store(true, Ordering::SeqCst);
            broker
        }

        fn waiting_count(&self) -> usize {
            self.waiting.lock().unwrap().len()
        }

        fn request_count(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        /// Drop the oldest request without answering it
        fn lose_oldest(&self) {
            drop(self.waiting.lock().unwrap().remove(0));
        }

        /// Acknowledge the oldest request, rejecting `rejected`
        fn release(&self, rejected: &str) {
            let (topics, reply) = self.waiting.lock().unwrap().remove(0);
            let results = topics
                .into_iter()
                .map(|topic| SubscribeResult {
                    granted: (topic != rejected).then_some(QoS::AtMostOnce),
                    topic,
                })
                .collect();
            reply.send(results).unwrap();
        }
    }

    #[async_trait]
    impl BrokerClient for ManualAckBroker {
        async fn publish(&self, _: &str, _: Bytes, _: QoS) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<PendingSubAck, BrokerError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail_requests.load(Ordering::SeqCst) {
                return Err(BrokerError::Request("connection not ready".into()));
            }
            let topics: Vec<String> = filters.into_iter().map(|(topic, _)| topic).collect();
            let (reply, pending) = oneshot::channel();
            if self.auto_grant.load(Ordering::SeqCst) {
                let results = topics
                    .into_iter()
                    .map(|topic| SubscribeResult {
                        topic,
                        granted: Some(QoS::AtMostOnce),
                    })
                    .collect();
                let _ = reply.send(results);
            } else {
                self.waiting.lock().unwrap().push((topics, reply));
            }
            Ok(pending)
        }

        async fn unsubscribe(&self, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    async fn wait_for_requests(broker: &ManualAckBroker, count: usize) {
        for _ in 0..200 {
            if broker.request_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} subscribe request(s), saw {}", count, broker.request_count());
    }

    async fn wait_for_request(broker: &ManualAckBroker) {
        for _ in 0..200 {
            if broker.waiting_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("resubscribe request never issued");
    }

    #[tokio::test]
    async fn test_rejected_resubscribe_is_fatal_and_stops_delivery() {
        let broker = Arc::new(ManualAckBroker::granting());
        let (event_tx, events) = mpsc::channel(16);
        let session = Session::new(broker.clone(), events);

        let mut on_a = session.subscribe("A", QoS::AtMostOnce).await.unwrap();
        let _on_b = session.subscribe("B", QoS::AtMostOnce).await.unwrap();
        broker.auto_grant.store(false, Ordering::SeqCst);

        let driver = tokio::spawn(session.run());
        event_tx
            .send(ConnectionEvent::Resumed { session_present: false })
            .await
            .unwrap();
        event_tx
            .send(ConnectionEvent::Message(Delivery::new("A", "early")))
            .await
            .unwrap();

        wait_for_request(&broker).await;
        broker.release("B");

        let result = driver.await.unwrap();
        assert_eq!(result, Err(ResubscriptionRejected { topic: "B".into() }));
        assert!(on_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_held_until_resubscribe_confirmed() {
        let broker = Arc::new(ManualAckBroker::granting());
        let (event_tx, events) = mpsc::channel(16);
        let session = Session::new(broker.clone(), events);

        let mut on_a = session.subscribe("A", QoS::AtMostOnce).await.unwrap();
        broker.auto_grant.store(false, Ordering::SeqCst);

        let driver = tokio::spawn(session.run());
        event_tx
            .send(ConnectionEvent::Resumed { session_present: false })
            .await
            .unwrap();
        event_tx
            .send(ConnectionEvent::Message(Delivery::new("A", "held")))
            .await
            .unwrap();

        wait_for_request(&broker).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(on_a.try_recv().is_err());

        broker.release("");
        let delivery = on_a.recv().await.unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"held"));

        event_tx.send(ConnectionEvent::Disconnected).await.unwrap();
        assert_eq!(driver.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_lost_resubscribe_reissued_on_persisted_resume() {
        let broker = Arc::new(ManualAckBroker::granting());
        let (event_tx, events) = mpsc::channel(16);
        let session = Session::new(broker.clone(), events);

        let mut on_a = session.subscribe("A", QoS::AtMostOnce).await.unwrap();
        broker.auto_grant.store(false, Ordering::SeqCst);

        let driver = tokio::spawn(session.run());
        event_tx
            .send(ConnectionEvent::Resumed { session_present: false })
            .await
            .unwrap();
        event_tx
            .send(ConnectionEvent::Message(Delivery::new("A", "held")))
            .await
            .unwrap();

        wait_for_request(&broker).await;
        broker.lose_oldest();

        event_tx
            .send(ConnectionEvent::Interrupted { reason: "drop".into() })
            .await
            .unwrap();
        event_tx
            .send(ConnectionEvent::Resumed { session_present: true })
            .await
            .unwrap();
        event_tx
            .send(ConnectionEvent::Message(Delivery::new("A", "later")))
            .await
            .unwrap();

        // The persisted session never saw the first resubscribe
        wait_for_requests(&broker, 3).await;
        wait_for_request(&broker).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(on_a.try_recv().is_err());

        broker.release("");
        assert_eq!(on_a.recv().await.unwrap().payload, Bytes::from_static(b"held"));
        assert_eq!(on_a.recv().await.unwrap().payload, Bytes::from_static(b"later"));

        event_tx.send(ConnectionEvent::Disconnected).await.unwrap();
        assert_eq!(driver.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_failed_resubscribe_request_retried_on_next_resume() {
        let broker = Arc::new(ManualAckBroker::granting());
        let (event_tx, events) = mpsc::channel(16);
        let session = Session::new(broker.clone(), events);

        let mut on_a = session.subscribe("A", QoS::AtMostOnce).await.unwrap();
        broker.fail_requests.store(true, Ordering::SeqCst);

        let driver = tokio::spawn(session.run());
        event_tx
            .send(ConnectionEvent::Resumed { session_present: false })
            .await
            .unwrap();
        wait_for_requests(&broker, 2).await;

        event_tx
            .send(ConnectionEvent::Message(Delivery::new("A", "held")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(on_a.try_recv().is_err());

        broker.fail_requests.store(false, Ordering::SeqCst);
        event_tx
            .send(ConnectionEvent::Resumed { session_present: true })
            .await
            .unwrap();

        assert_eq!(on_a.recv().await.unwrap().payload, Bytes::from_static(b"held"));
        assert_eq!(broker.request_count(), 3);

        event_tx.send(ConnectionEvent::Disconnected).await.unwrap();
        assert_eq!(driver.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_persisted_session_keeps_delivering() {
        let hub = LoopbackHub::new();
        let session = connect(&hub, "sub").await;
        let mut deliveries = session.subscribe("a", QoS::AtMostOnce).await.unwrap();
        let driver = tokio::spawn(session.run());

        hub.interrupt("sub").await;
        hub.resume("sub", true).await;

        let (publisher, _events) = hub.connect("pub").await;
        publisher
            .publish("a", Bytes::from_static(b"x"), QoS::AtMostOnce)
            .await
            .unwrap();
        assert!(deliveries.recv().await.is_some());
        assert_eq!(hub.subscribe_attempts("a").await, 1);

        driver.abort();
    }

    #[tokio::test]
    async fn test_disconnect_ends_session() {
        let hub = LoopbackHub::new();
        let session = connect(&hub, "sub").await;
        let broker = session.broker();
        broker.disconnect().await.unwrap();

        assert_eq!(session.run().await, Ok(()));
    }
}
