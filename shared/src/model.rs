//! Protocol model: shadow documents and work orders
//!
//! Every payload on the wire is UTF-8 JSON built from these types.

use serde::{Deserialize, Serialize};
use serde_json::Number;

/// One projection of a robot's shadow (`desired` or `reported`)
///
/// Build it through [`ShadowState::idle`], [`ShadowState::busy`] or
/// [`ShadowState::for_order`], which keep `idle == order_id.is_none()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowState {
    pub thing_name: String,
    pub idle: bool,
    pub order_id: Option<u64>,
    pub paused: bool,
}

impl ShadowState {
    /// State of a robot waiting for work
    pub fn idle(thing_name: impl Into<String>) -> Self {
        Self::for_order(thing_name, None)
    }

    /// State of a robot working on `order_id`
    pub fn busy(thing_name: impl Into<String>, order_id: u64) -> Self {
        Self::for_order(thing_name, Some(order_id))
    }

    /// Build the state for an optional in-flight order
    pub fn for_order(thing_name: impl Into<String>, order_id: Option<u64>) -> Self {
        Self {
            thing_name: thing_name.into(),
            idle: order_id.is_none(),
            order_id,
            paused: false,
        }
    }

    /// Check the idle/order invariant
    pub fn is_consistent(&self) -> bool {
        self.idle == self.order_id.is_none()
    }
}

/// Both projections of a shadow update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowSections {
    pub desired: ShadowState,
    pub reported: ShadowState,
}

/// Shadow update request published by a robot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowDocument {
    pub state: ShadowSections,
}

impl ShadowDocument {
    /// Create a document whose desired and reported states match
    pub fn reporting(state: ShadowState) -> Self {
        Self {
            state: ShadowSections {
                desired: state.clone(),
                reported: state,
            },
        }
    }
}

/// A single line of an order
///
/// `quantity` keeps the number exactly as it was written: `120` stays an
/// integer on the wire, `1.5` stays a decimal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub material: String,
    pub quantity: Number,
    pub unit: String,
}

impl Ingredient {
    pub fn new(
        material: impl Into<String>,
        quantity: impl Into<Number>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            material: material.into(),
            quantity: quantity.into(),
            unit: unit.into(),
        }
    }
}

/// Work order sent from the coordinator to a robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub ingredients: Vec<Ingredient>,
}

impl Order {
    /// The fixed order the coordinator currently hands out: 120 g of chicken
    pub fn chicken(order_id: u64) -> Self {
        Self {
            order_id,
            ingredients: vec![Ingredient::new("chicken", 120u64, "g")],
        }
    }
}
