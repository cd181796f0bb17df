//! Kitchen coordinator
//!
//! Watches the accepted shadow updates of every robot and sends a new order
//! to each robot that turns idle.

pub mod dispatch;

pub use dispatch::{Decision, DispatchEngine, FixedOrderIds, OrderIdSource, RandomOrderIds};
