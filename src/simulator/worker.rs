//! Work simulator
//!
//! Runs a background loop that takes orders from the order slot, works them
//! for a fixed number of steps and reports each step to the shadow service.

use kitchen_shared::broker::SharedBroker;
use kitchen_shared::state_machine::{WorkEvent, WorkStateMachine, WorkTransition};
use kitchen_shared::{codec, timing, topics, Order, QoS, ShadowDocument, ShadowState};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub thing_name: String,
    /// Time between busy heartbeats
    pub step_interval: Duration,
    /// Busy heartbeats per order
    pub busy_steps: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            thing_name: "robot".into(),
            step_interval: Duration::from_millis(timing::STEP_INTERVAL_MS),
            busy_steps: timing::BUSY_STEPS,
        }
    }
}

/// Handoff point between order intake and the simulator
///
/// Holds at most one order. Offering never blocks.
#[derive(Clone)]
pub struct OrderSlot {
    tx: mpsc::Sender<Order>,
}

impl OrderSlot {
    /// Hand an order to the simulator; returns false if it was dropped
    pub fn offer(&self, order: Order) -> bool {
        match self.tx.try_send(order) {
            Ok(()) => true,
            Err(TrySendError::Full(order)) => {
                warn!("[SIM] Order slot full, dropping order {}", order.order_id);
                false
            }
            Err(TrySendError::Closed(order)) => {
                warn!("[SIM] Simulator stopped, dropping order {}", order.order_id);
                false
            }
        }
    }
}

/// Simulates one robot working through its orders
pub struct WorkSimulator {
    config: SimulatorConfig,
    broker: SharedBroker,
    fsm: WorkStateMachine,
    orders: mpsc::Receiver<Order>,
}

impl WorkSimulator {
    /// Create a simulator and the slot that feeds it
    pub fn new(config: SimulatorConfig, broker: SharedBroker) -> (Self, OrderSlot) {
        let (tx, orders) = mpsc::channel(1);
        let simulator = Self {
            fsm: WorkStateMachine::with_busy_steps(config.busy_steps),
            config,
            broker,
            orders,
        };
        (simulator, OrderSlot { tx })
    }

    /// Number of orders worked to completion
    pub fn orders_completed(&self) -> u64 {
        self.fsm.orders_completed()
    }

    /// Report idle, then work orders until every slot handle is gone
    pub async fn run(mut self) {
        self.publish_state(ShadowState::idle(&self.config.thing_name))
            .await;

        while let Some(order) = self.orders.recv().await {
            self.work(order).await;
        }

        info!(
            "[SIM] Order slot closed after {} order(s)",
            self.orders_completed()
        );
    }

    async fn work(&mut self, order: Order) {
        info!("[SIM] Working on order {}", order.order_id);
        self.apply(WorkEvent::OrderReceived {
            order_id: order.order_id,
        })
        .await;

        let period = self.config.step_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        // A stalled publish must not squeeze the following steps together
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.fsm.is_busy() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.apply(WorkEvent::Tick).await;
                }
                Some(order) = self.orders.recv() => {
                    self.apply(WorkEvent::OrderReceived { order_id: order.order_id }).await;
                }
            }
        }
    }

    async fn apply(&mut self, event: WorkEvent) {
        let transition = self.fsm.process_event(event);

        match &transition {
            WorkTransition::Busy { order_id, step } => {
                debug!("[SIM] Order {} step {}/{}", order_id, step, self.config.busy_steps);
            }
            WorkTransition::Completed { order_id } => {
                info!("[SIM] Order {} complete", order_id);
            }
            WorkTransition::Ignored { state, event } => {
                warn!("[SIM] Ignoring {:?} while {:?}", event, state);
            }
        }

        if let Some(state) = transition.report(&self.config.thing_name) {
            self.publish_state(state).await;
        }
    }

    async fn publish_state(&self, state: ShadowState) {
        let topic = topics::shadow_update(&self.config.thing_name);
        let payload = match codec::encode_shadow(&ShadowDocument::reporting(state)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("[SIM] Failed to encode shadow: {}", e);
                return;
            }
        };

        info!(
            "Publishing message to topic '{}': {}",
            topic,
            String::from_utf8_lossy(&payload)
        );
        if let Err(e) = self.broker.publish(&topic, payload, QoS::AtMostOnce).await {
            error!("[SIM] Failed to publish shadow: {}", e);
        }
    }
}
