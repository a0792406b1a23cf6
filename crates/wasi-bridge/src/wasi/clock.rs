//! Host-provided clock and entropy, both injectable for deterministic tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

pub trait Clock: Send + Sync {
    /// Nanoseconds since the unix epoch.
    fn realtime(&self) -> u64;
    /// Nanoseconds since an arbitrary, fixed point.
    fn monotonic(&self) -> u64;
    /// Whether the clock advances by itself; a frozen clock never blocks in
    /// `poll_oneoff`.
    fn is_live(&self) -> bool {
        true
    }
}

pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn realtime(&self) -> u64 {
        Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.max(0) as u64)
            .unwrap_or(u64::MAX)
    }

    fn monotonic(&self) -> u64 {
        self.start.elapsed().as_nanos().min(u64::MAX as u128) as u64
    }
}

/// A clock frozen at a fixed instant.
pub struct FixedClock {
    nanos: u64,
}

impl FixedClock {
    pub fn new(nanos: u64) -> Self {
        Self { nanos }
    }
}

impl Clock for FixedClock {
    fn realtime(&self) -> u64 {
        self.nanos
    }

    fn monotonic(&self) -> u64 {
        self.nanos
    }

    fn is_live(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ClockSource {
    #[default]
    System,
    Fixed { nanos: u64 },
}

impl ClockSource {
    pub fn build(self) -> Arc<dyn Clock> {
        match self {
            ClockSource::System => Arc::new(SystemClock::default()),
            ClockSource::Fixed { nanos } => Arc::new(FixedClock::new(nanos)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RandomSource {
    #[default]
    Os,
    Seeded { seed: u64 },
}

/// The generator behind `random_get`, shared by every thread of a session.
#[derive(Clone)]
pub struct Random {
    rng: Arc<Mutex<StdRng>>,
}

impl Random {
    pub fn new(source: RandomSource) -> Self {
        let rng = match source {
            RandomSource::Os => StdRng::from_entropy(),
            RandomSource::Seeded { seed } => StdRng::seed_from_u64(seed),
        };
        Self {
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn fill(&self, buf: &mut [u8]) {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_bytes(buf)
    }
}
