//! Primary-vs-fallback routing.
//!
//! Each firing is an independent Bernoulli trial: draw `u ∈ [0, 1)` and route to the
//! agent when `u < migration_weight`. Nothing is sticky, so consecutive firings of the
//! same trigger may take different paths.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tasks::{DecisionMode, FallbackStrategy};

/// Source of uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Reproducible sequence from a seed.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..1.0),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..1.0),
        }
    }
}

/// Always returns the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// Route one firing.
pub fn choose(migration_weight: f64, rng: &dyn RandomSource) -> DecisionMode {
    if rng.next_f64() < migration_weight {
        DecisionMode::Agent
    } else {
        DecisionMode::Fallback
    }
}

/// Whether the fallback handler runs after a primary run that ended with `primary_failed`.
pub fn fallback_after_primary(strategy: FallbackStrategy, primary_failed: bool) -> bool {
    match strategy {
        FallbackStrategy::Never => false,
        FallbackStrategy::OnFailure => primary_failed,
        FallbackStrategy::Always => true,
    }
}
