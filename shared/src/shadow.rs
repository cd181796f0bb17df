//! Shadow Store
//!
//! Tracks one robot's last reported shadow and classifies each new report as
//! an actionable transition or a no-op.

use serde::Deserialize;
use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::model::ShadowState;

/// Errors raised while applying a reported update
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShadowError {
    #[error("Invalid shadow update: {0}")]
    InvalidUpdate(String),
}

impl From<CodecError> for ShadowError {
    fn from(err: CodecError) -> Self {
        ShadowError::InvalidUpdate(err.to_string())
    }
}

/// Logical change detected by [`ShadowStore::apply_reported`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowTransition {
    /// Robot went from busy (or unknown) to idle
    BecameIdle,
    /// Robot went from idle (or unknown) to busy
    BecameBusy,
    /// `idle` did not change
    Unchanged,
}

/// Reported projection as received from the broker, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReportedUpdate {
    pub thing_name: Option<String>,
    pub idle: Option<bool>,
    pub order_id: Option<u64>,
    pub paused: Option<bool>,
}

impl ReportedUpdate {
    /// Check required fields and the idle/order invariant
    pub fn validate(&self) -> Result<ShadowState, ShadowError> {
        let thing_name = self
            .thing_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ShadowError::InvalidUpdate("missing thing_name".into()))?;

        let idle = self
            .idle
            .ok_or_else(|| ShadowError::InvalidUpdate("missing idle".into()))?;

        if idle != self.order_id.is_none() {
            return Err(ShadowError::InvalidUpdate(format!(
                "idle={} contradicts order_id={:?}",
                idle, self.order_id
            )));
        }

        Ok(ShadowState {
            thing_name: thing_name.to_string(),
            idle,
            order_id: self.order_id,
            paused: self.paused.unwrap_or(false),
        })
    }
}

impl From<&ShadowState> for ReportedUpdate {
    fn from(state: &ShadowState) -> Self {
        Self {
            thing_name: Some(state.thing_name.clone()),
            idle: Some(state.idle),
            order_id: state.order_id,
            paused: Some(state.paused),
        }
    }
}

/// Last-known reported state of a single robot
#[derive(Debug, Clone)]
pub struct ShadowStore {
    thing_name: String,
    last_reported: Option<ShadowState>,
    updates_applied: u64,
}

impl ShadowStore {
    /// Create a store for `thing_name` with no report seen yet
    pub fn new(thing_name: impl Into<String>) -> Self {
        Self {
            thing_name: thing_name.into(),
            last_reported: None,
            updates_applied: 0,
        }
    }

    /// The robot this store tracks
    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// Last valid reported state, `None` until the first report arrives
    pub fn last_reported(&self) -> Option<&ShadowState> {
        self.last_reported.as_ref()
    }

    /// Number of valid updates applied so far
    pub fn updates_applied(&self) -> u64 {
        self.updates_applied
    }

    /// Apply a freshly received reported state
    ///
    /// The stored state is replaced on every valid update, including
    /// `Unchanged` ones. Invalid updates leave the store untouched.
    pub fn apply_reported(
        &mut self,
        update: &ReportedUpdate,
    ) -> Result<ShadowTransition, ShadowError> {
        let state = update.validate()?;

        if state.thing_name != self.thing_name {
            return Err(ShadowError::InvalidUpdate(format!(
                "update for {} applied to store of {}",
                state.thing_name, self.thing_name
            )));
        }

        let previous = self.last_reported.as_ref().map(|s| s.idle);
        let result = classify(previous, state.idle);

        self.last_reported = Some(state);
        self.updates_applied += 1;

        Ok(result)
    }

    /// Decode an accepted shadow document and apply its reported state
    pub fn apply_payload(&mut self, payload: &[u8]) -> Result<ShadowTransition, ShadowError> {
        let update = codec::decode_reported(payload)?;
        self.apply_reported(&update)
    }
}

/// Classify an idle change; an unknown previous state counts as a change
fn classify(previous: Option<bool>, idle: bool) -> ShadowTransition {
    match (previous, idle) {
        (Some(was_idle), now_idle) if was_idle == now_idle => ShadowTransition::Unchanged,
        (_, true) => ShadowTransition::BecameIdle,
        (_, false) => ShadowTransition::BecameBusy,
    }
}
