//! Dispatch engine: turns accepted shadow updates into orders

use super::fleet::{AppliedUpdate, FleetRegistry};
use super::order_ids::OrderIdSource;
use kitchen_shared::broker::SharedBroker;
use kitchen_shared::{codec, topics, Delivery, Order, QoS, ShadowError, ShadowTransition};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What the engine decided for one accepted update
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The robot just became idle; send it this order
    Dispatch { thing_name: String, order: Order },
    /// Valid update that needs no order
    NoAction {
        thing_name: String,
        transition: ShadowTransition,
        idle: bool,
    },
    /// Update could not be used
    Invalid(ShadowError),
}

/// Sends an order to every robot that becomes idle
pub struct DispatchEngine<I: OrderIdSource> {
    broker: SharedBroker,
    fleet: FleetRegistry,
    order_ids: I,
}

impl<I: OrderIdSource> DispatchEngine<I> {
    pub fn new(broker: SharedBroker, order_ids: I) -> Self {
        Self {
            broker,
            fleet: FleetRegistry::new(),
            order_ids,
        }
    }

    /// Current view of the fleet
    pub fn fleet(&self) -> &FleetRegistry {
        &self.fleet
    }

    /// Apply an accepted update and decide whether an order is due
    ///
    /// An order id is drawn only for a `Dispatch` decision.
    pub fn evaluate(&mut self, delivery: &Delivery) -> Decision {
        let update = match codec::decode_reported(&delivery.payload) {
            Ok(update) => update,
            Err(e) => return Decision::Invalid(e.into()),
        };

        if let (Some(from_topic), Some(reported)) = (
            topics::thing_from_shadow_topic(&delivery.topic),
            update.thing_name.as_deref(),
        ) {
            if from_topic != reported {
                return Decision::Invalid(ShadowError::InvalidUpdate(format!(
                    "topic names {} but update names {}",
                    from_topic, reported
                )));
            }
        }

        match self.fleet.apply(&update) {
            Ok(AppliedUpdate {
                thing_name,
                transition: ShadowTransition::BecameIdle,
                ..
            }) => Decision::Dispatch {
                thing_name,
                order: Order::chicken(self.order_ids.next_id()),
            },
            Ok(AppliedUpdate {
                thing_name,
                transition,
                idle,
                quiet_for,
            }) => {
                if let Some(quiet_for) = quiet_for {
                    debug!("[DISPATCH] {} reported after {:?}", thing_name, quiet_for);
                }
                Decision::NoAction {
                    thing_name,
                    transition,
                    idle,
                }
            }
            Err(e) => Decision::Invalid(e),
        }
    }

    /// Handle one accepted update; returns the order that was sent, if any
    pub async fn handle(&mut self, delivery: &Delivery) -> Option<Order> {
        match self.evaluate(delivery) {
            Decision::Dispatch { thing_name, order } => {
                info!("Robot {} is idle: true", thing_name);
                if self.publish_order(&thing_name, &order).await {
                    Some(order)
                } else {
                    None
                }
            }
            Decision::NoAction {
                thing_name,
                transition,
                idle,
            } => {
                info!("Robot {} is idle: {}", thing_name, idle);
                debug!("[DISPATCH] {} {:?}, no order", thing_name, transition);
                None
            }
            Decision::Invalid(e) => {
                warn!(
                    "[DISPATCH] Ignoring shadow update on {}: {}",
                    delivery.topic, e
                );
                None
            }
        }
    }

    async fn publish_order(&mut self, thing_name: &str, order: &Order) -> bool {
        info!(
            "Sending next order {} to the robot {}",
            order.order_id, thing_name
        );

        let payload = match codec::encode_order(order) {
            Ok(payload) => payload,
            Err(e) => {
                error!("[DISPATCH] Failed to encode order {}: {}", order.order_id, e);
                return false;
            }
        };

        let topic = topics::process_order(thing_name);
        match self.broker.publish(&topic, payload, QoS::AtMostOnce).await {
            Ok(()) => {
                self.fleet.record_dispatch(thing_name, order.order_id);
                true
            }
            Err(e) => {
                error!("[DISPATCH] Failed to publish order to {}: {}", thing_name, e);
                false
            }
        }
    }

    /// Process accepted updates until the stream closes
    pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<Delivery>) {
        info!("[DISPATCH] Waiting for shadow updates");
        while let Some(delivery) = updates.recv().await {
            self.handle(&delivery).await;
        }
        info!(
            "[DISPATCH] Update stream closed, {} robot(s) seen",
            self.fleet.len()
        );
    }
}
