//! Robot Work State Machine
//!
//! Defines how a robot moves through an order:
//! `Idle → Busy(order_id, step 1..=BUSY_STEPS) → Idle`.

use crate::model::ShadowState;
use crate::timing;

/// Current activity of a robot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Waiting for an order
    Idle,
    /// Working on an order; `step` counts published busy heartbeats
    Busy { order_id: u64, step: u32 },
}

impl WorkState {
    /// The order in flight, if any
    pub fn order_id(&self) -> Option<u64> {
        match self {
            WorkState::Idle => None,
            WorkState::Busy { order_id, .. } => Some(*order_id),
        }
    }
}

/// Events that drive the work state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkEvent {
    /// An order arrived from the coordinator
    OrderReceived { order_id: u64 },
    /// The step interval elapsed
    Tick,
}

/// Result of feeding an event to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkTransition {
    /// Robot is (still) busy; publish the busy shadow
    Busy { order_id: u64, step: u32 },
    /// Order finished; publish the idle shadow
    Completed { order_id: u64 },
    /// Event does not apply in the current state
    Ignored { state: WorkState, event: WorkEvent },
}

impl WorkTransition {
    /// Shadow state to publish for this transition, `None` when ignored
    pub fn report(&self, thing_name: &str) -> Option<ShadowState> {
        match self {
            WorkTransition::Busy { order_id, .. } => Some(ShadowState::busy(thing_name, *order_id)),
            WorkTransition::Completed { .. } => Some(ShadowState::idle(thing_name)),
            WorkTransition::Ignored { .. } => None,
        }
    }
}

/// The work state machine of a single robot
#[derive(Debug)]
pub struct WorkStateMachine {
    current_state: WorkState,
    busy_steps: u32,
    orders_completed: u64,
}

impl Default for WorkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self::with_busy_steps(timing::BUSY_STEPS)
    }

    /// Create a state machine that stays busy for `busy_steps` heartbeats
    pub fn with_busy_steps(busy_steps: u32) -> Self {
        Self {
            current_state: WorkState::Idle,
            busy_steps: busy_steps.max(1),
            orders_completed: 0,
        }
    }

    /// Get current state
    pub fn state(&self) -> WorkState {
        self.current_state
    }

    /// Whether an order is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self.current_state, WorkState::Busy { .. })
    }

    /// Number of orders run to completion
    pub fn orders_completed(&self) -> u64 {
        self.orders_completed
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: WorkEvent) -> WorkTransition {
        use WorkState::*;

        match (self.current_state, event) {
            (Idle, WorkEvent::OrderReceived { order_id }) => {
                self.current_state = Busy { order_id, step: 1 };
                WorkTransition::Busy { order_id, step: 1 }
            }

            (Busy { order_id, step }, WorkEvent::Tick) => {
                let step = step + 1;
                if step <= self.busy_steps {
                    self.current_state = Busy { order_id, step };
                    WorkTransition::Busy { order_id, step }
                } else {
                    self.current_state = Idle;
                    self.orders_completed += 1;
                    WorkTransition::Completed { order_id }
                }
            }

            // Orders arriving mid-work are dropped; the in-flight one finishes
            (state @ Busy { .. }, event @ WorkEvent::OrderReceived { .. })
            | (state @ Idle, event @ WorkEvent::Tick) => WorkTransition::Ignored { state, event },
        }
    }
}
