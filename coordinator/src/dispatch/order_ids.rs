//! Order id sources
//!
//! Ids are not required to be unique; two robots may well receive the same id.

use kitchen_shared::timing;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Hands out order ids
pub trait OrderIdSource: Send {
    fn next_id(&mut self) -> u64;
}

/// Uniformly random ids from an inclusive range
pub struct RandomOrderIds {
    rng: StdRng,
    min: u64,
    max: u64,
}

impl Default for RandomOrderIds {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomOrderIds {
    /// Ids in `[ORDER_ID_MIN, ORDER_ID_MAX]`
    pub fn new() -> Self {
        Self::in_range(timing::ORDER_ID_MIN, timing::ORDER_ID_MAX)
    }

    pub fn in_range(min: u64, max: u64) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            min: min.max(1),
            max: max.max(min.max(1)),
        }
    }

    /// Reproducible sequence for a given seed
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            ..Self::new()
        }
    }
}

impl OrderIdSource for RandomOrderIds {
    fn next_id(&mut self) -> u64 {
        self.rng.gen_range(self.min..=self.max)
    }
}

/// Cycles through a fixed list of ids
pub struct FixedOrderIds {
    ids: Vec<u64>,
    next: usize,
}

impl FixedOrderIds {
    /// `ids` must not be empty
    pub fn new(ids: impl Into<Vec<u64>>) -> Self {
        let mut ids = ids.into();
        if ids.is_empty() {
            ids.push(timing::ORDER_ID_MIN);
        }
        Self { ids, next: 0 }
    }
}

impl OrderIdSource for FixedOrderIds {
    fn next_id(&mut self) -> u64 {
        let id = self.ids[self.next % self.ids.len()];
        self.next += 1;
        id
    }
}
