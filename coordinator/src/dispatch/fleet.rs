//! Fleet registry: per-robot shadow and dispatch state

use kitchen_shared::shadow::ReportedUpdate;
use kitchen_shared::{ShadowError, ShadowStore, ShadowTransition};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Dispatch view of a robot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// No report received yet
    Unknown,
    /// Working, or an order was just published to it
    Busy,
    /// Reported idle and waiting for an order
    Idle,
}

/// Everything the coordinator knows about one robot
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub shadow: ShadowStore,
    pub state: UnitState,
    pub last_order_id: Option<u64>,
    pub orders_dispatched: u64,
    pub last_seen: Instant,
}

impl UnitRecord {
    pub fn new(thing_name: &str) -> Self {
        Self {
            shadow: ShadowStore::new(thing_name),
            state: UnitState::Unknown,
            last_order_id: None,
            orders_dispatched: 0,
            last_seen: Instant::now(),
        }
    }
}

/// A reported update after it went through the robot's shadow store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub thing_name: String,
    pub transition: ShadowTransition,
    pub idle: bool,
    /// Time since the robot's previous report, `None` for its first one
    pub quiet_for: Option<Duration>,
}

/// Tracks all robots that ever reported
#[derive(Debug, Default)]
pub struct FleetRegistry {
    units: HashMap<String, UnitRecord>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a reported update to the robot it names
    ///
    /// Invalid updates are rejected before a record is created for them.
    pub fn apply(&mut self, update: &ReportedUpdate) -> Result<AppliedUpdate, ShadowError> {
        let state = update.validate()?;

        let known = self.units.contains_key(&state.thing_name);
        let unit = self
            .units
            .entry(state.thing_name.clone())
            .or_insert_with(|| UnitRecord::new(&state.thing_name));

        let transition = unit.shadow.apply_reported(update)?;
        let now = Instant::now();
        let quiet_for = known.then(|| now.duration_since(unit.last_seen));
        unit.last_seen = now;

        match transition {
            ShadowTransition::BecameIdle => unit.state = UnitState::Idle,
            ShadowTransition::BecameBusy => unit.state = UnitState::Busy,
            ShadowTransition::Unchanged => {}
        }

        Ok(AppliedUpdate {
            thing_name: state.thing_name,
            transition,
            idle: state.idle,
            quiet_for,
        })
    }

    /// Note that an order was published to `thing_name`
    pub fn record_dispatch(&mut self, thing_name: &str, order_id: u64) {
        if let Some(unit) = self.units.get_mut(thing_name) {
            unit.state = UnitState::Busy;
            unit.last_order_id = Some(order_id);
            unit.orders_dispatched += 1;
        }
    }

    /// Get info about a specific robot
    pub fn get(&self, thing_name: &str) -> Option<&UnitRecord> {
        self.units.get(thing_name)
    }

    /// Names of all known robots, sorted
    pub fn things(&self) -> Vec<String> {
        let mut things: Vec<String> = self.units.keys().cloned().collect();
        things.sort();
        things
    }

    /// Robots currently waiting for work
    pub fn idle_count(&self) -> usize {
        self.units
            .values()
            .filter(|unit| unit.state == UnitState::Idle)
            .count()
    }

    /// Get the number of known robots
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kitchen_shared::ShadowState;

    fn report(state: &ShadowState) -> ReportedUpdate {
        state.into()
    }

    #[test]
    fn test_unit_state_follows_reports() {
        let mut fleet = FleetRegistry::new();

        let applied = fleet.apply(&report(&ShadowState::busy("r1", 3))).unwrap();
        assert_eq!(applied.transition, ShadowTransition::BecameBusy);
        assert_eq!(fleet.get("r1").unwrap().state, UnitState::Busy);

        let applied = fleet.apply(&report(&ShadowState::idle("r1"))).unwrap();
        assert_eq!(applied.transition, ShadowTransition::BecameIdle);
        assert!(applied.idle);
        assert_eq!(fleet.idle_count(), 1);

        fleet.record_dispatch("r1", 9);
        let unit = fleet.get("r1").unwrap();
        assert_eq!(unit.state, UnitState::Busy);
        assert_eq!(unit.last_order_id, Some(9));
        assert_eq!(unit.orders_dispatched, 1);
    }

    #[test]
    fn test_units_are_independent() {
        let mut fleet = FleetRegistry::new();
        fleet.apply(&report(&ShadowState::idle("r1"))).unwrap();
        fleet.apply(&report(&ShadowState::busy("r2", 1))).unwrap();

        assert_eq!(fleet.things(), vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(fleet.get("r1").unwrap().state, UnitState::Idle);
        assert_eq!(fleet.get("r2").unwrap().state, UnitState::Busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_time_between_reports() {
        let mut fleet = FleetRegistry::new();

        let first = fleet.apply(&report(&ShadowState::idle("r1"))).unwrap();
        assert_eq!(first.quiet_for, None);

        tokio::time::advance(Duration::from_secs(3)).await;
        let second = fleet.apply(&report(&ShadowState::busy("r1", 4))).unwrap();
        assert_eq!(second.quiet_for, Some(Duration::from_secs(3)));
        assert_eq!(fleet.get("r1").unwrap().last_seen, Instant::now());
    }

    #[test]
    fn test_invalid_update_creates_no_record() {
        let mut fleet = FleetRegistry::new();
        let update = ReportedUpdate {
            thing_name: Some("ghost".into()),
            ..Default::default()
        };
        assert!(fleet.apply(&update).is_err());
        assert!(fleet.is_empty());
    }
}
