//! Kitchen Fleet Shared Protocol
//!
//! This crate provides the protocol types, codec and broker plumbing shared
//! between kitchen robots and the coordinator that dispatches their orders.

pub mod broker;
pub mod cli;
pub mod codec;
pub mod model;
pub mod resubscribe;
pub mod session;
pub mod shadow;
pub mod state_machine;
pub mod topics;

// Re-export commonly used types at crate root
pub use broker::{BrokerClient, BrokerError, ConnectionEvent, Delivery, QoS};
pub use model::{Ingredient, Order, ShadowDocument, ShadowState};
pub use resubscribe::{ResubscriptionManager, ResubscriptionRejected};
pub use session::Session;
pub use shadow::{ShadowError, ShadowStore, ShadowTransition};

/// Timing and protocol parameters for the fleet
pub mod timing {
    /// Default MQTT port (TLS)
    pub const DEFAULT_PORT: u16 = 8883;

    /// MQTT keep-alive interval in seconds
    pub const KEEP_ALIVE_SECS: u64 = 6;

    /// Time to wait for the broker's CONNACK on the initial connect
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Initial delay before retrying after a connection error
    pub const RECONNECT_DELAY_MS: u64 = 1_000;

    /// Upper bound for the reconnect backoff
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

    /// Interval between busy heartbeats while a robot works an order
    pub const STEP_INTERVAL_MS: u64 = 3_000;

    /// Number of busy heartbeats published per order
    pub const BUSY_STEPS: u32 = 4;

    /// Smallest order id the coordinator hands out
    pub const ORDER_ID_MIN: u64 = 1;

    /// Largest order id the coordinator hands out
    pub const ORDER_ID_MAX: u64 = 100;
}
