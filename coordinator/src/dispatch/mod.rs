//! Order dispatch
//!
//! This module handles:
//! - Tracking the last reported state of every robot
//! - Deciding when a robot is due for a new order
//! - Publishing orders to the robot's order topic

mod engine;
mod fleet;
mod order_ids;

pub use engine::{Decision, DispatchEngine};
pub use fleet::{AppliedUpdate, FleetRegistry, UnitRecord, UnitState};
pub use order_ids::{FixedOrderIds, OrderIdSource, RandomOrderIds};
