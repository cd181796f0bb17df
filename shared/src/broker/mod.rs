//! Broker client capability
//!
//! This module handles:
//! - The `BrokerClient` trait both roles publish and subscribe through
//! - The connection lifecycle (connected / interrupted / resumed)
//! - An MQTT implementation backed by rumqttc
//! - An in-process loopback broker for development and tests
//!
//! Inbound traffic never arrives through callbacks: every implementation
//! hands out a `mpsc::Receiver<ConnectionEvent>` that the session driver
//! consumes.

mod lifecycle;
pub mod loopback;
mod mqtt;

pub use lifecycle::{ConnectionLifecycle, ConnectionState};
pub use loopback::{LoopbackBroker, LoopbackHub};
pub use mqtt::{BrokerConfig, MqttBroker, TlsFiles};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            // Never requested, so a broker only grants it by upgrading us
            rumqttc::QoS::AtLeastOnce | rumqttc::QoS::ExactlyOnce => QoS::AtLeastOnce,
        }
    }
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Events emitted by a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Initial connection established
    Connected { session_present: bool },
    /// Connection lost; the client keeps trying to reconnect
    Interrupted { reason: String },
    /// Connection re-established after an interruption
    Resumed { session_present: bool },
    /// Message received on a subscribed topic
    Message(Delivery),
    /// Connection closed on request
    Disconnected,
}

/// Grant for one topic of a subscribe request; `granted` is `None` when the
/// broker rejected the topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    pub topic: String,
    pub granted: Option<QoS>,
}

/// Outcome of a subscribe request, resolved when the broker acknowledges it
///
/// The sender is dropped without a value when the acknowledgement can no
/// longer arrive (connection lost before SUBACK).
pub type PendingSubAck = oneshot::Receiver<Vec<SubscribeResult>>;

/// Errors raised by broker clients
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Client request failed: {0}")]
    Request(String),

    #[error("Broker client closed")]
    Closed,

    #[error("Broker rejected subscription to {topic}")]
    SubscribeRejected { topic: String },
}

/// Operations available on a connected broker client
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Publish a payload; at-most-once publishes carry no acknowledgement
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), BrokerError>;

    /// Issue one subscribe request covering every filter
    async fn subscribe(&self, filters: Vec<(String, QoS)>) -> Result<PendingSubAck, BrokerError>;

    /// Drop a subscription on the broker side
    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;

    /// Close the connection gracefully
    async fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Broker handle shared between the session driver and role tasks
pub type SharedBroker = Arc<dyn BrokerClient>;
