//! Order intake - decodes dispatched orders and hands them to the simulator

use crate::simulator::OrderSlot;
use kitchen_shared::{codec, Delivery};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Decode one delivery and offer the order; returns the accepted order id
pub fn accept(delivery: &Delivery, slot: &OrderSlot) -> Option<u64> {
    info!(
        "Received message from topic '{}': {}",
        delivery.topic,
        String::from_utf8_lossy(&delivery.payload)
    );

    match codec::decode_order(&delivery.payload) {
        Ok(order) => {
            let order_id = order.order_id;
            slot.offer(order).then_some(order_id)
        }
        Err(e) => {
            warn!("[ORDER] Dropping malformed order on {}: {}", delivery.topic, e);
            None
        }
    }
}

/// Forward orders until the subscription closes
pub async fn run_intake(mut deliveries: mpsc::UnboundedReceiver<Delivery>, slot: OrderSlot) {
    while let Some(delivery) = deliveries.recv().await {
        accept(&delivery, &slot);
    }
    info!("[ORDER] Order subscription closed");
}
