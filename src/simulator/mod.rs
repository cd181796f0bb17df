//! Work simulation
//!
//! This module handles:
//! - Accepting at most one pending order at a time
//! - Stepping the work state machine on a fixed interval
//! - Publishing the robot's shadow after every state change

mod worker;

pub use worker::{OrderSlot, SimulatorConfig, WorkSimulator};
