//! Injected randomness for assignment and traffic gating.
//!
//! Weighted selection and traffic gating draw from a [`RandomSource`]
//! rather than a global RNG, so tests can supply seeded or scripted
//! sequences and assert exact outcomes.

use std::collections::VecDeque;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniform randomness in [0, 1).
pub trait RandomSource: Send + Sync {
    fn next_fraction(&self) -> f64;
}

/// Production source backed by the thread-local RNG.
#[derive(Default)]
pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn next_fraction(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Deterministic source seeded from a fixed value. Draws are still
/// uniformly distributed, so statistical tests stay meaningful while
/// remaining reproducible.
pub struct SeededSource {
    rng: Mutex<StdRng>,
}

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededSource {
    fn next_fraction(&self) -> f64 {
        self.rng.lock().expect("rng lock poisoned").gen::<f64>()
    }
}

/// Scripted source that replays an exact sequence of draws, then repeats
/// the last value. Intended for unit tests that pin a single decision.
pub struct SequenceSource {
    values: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
}

impl SequenceSource {
    pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
            last: Mutex::new(0.0),
        }
    }
}

impl RandomSource for SequenceSource {
    fn next_fraction(&self) -> f64 {
        let mut values = self.values.lock().expect("sequence lock poisoned");
        match values.pop_front() {
            Some(v) => {
                *self.last.lock().expect("sequence lock poisoned") = v;
                v
            }
            None => *self.last.lock().expect("sequence lock poisoned"),
        }
    }
}
