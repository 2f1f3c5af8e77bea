// Test fixtures and workload generators for integration tests

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use strata_dlm::config::DlmConfig;
use strata_dlm::types::{Extent, LockMode, PolicyData, ResourceId};

/// Deterministic random workload generator for reproducible tests
pub struct WorkloadGenerator {
    rng: StdRng,
}

impl WorkloadGenerator {
    /// Creates a new generator with a fixed seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One of the first `count` resources
    pub fn resource(&mut self, count: u64) -> ResourceId {
        ResourceId::new(self.rng.gen_range(1..=count))
    }

    /// A mode clients commonly request
    pub fn mode(&mut self) -> LockMode {
        const MODES: [LockMode; 4] = [LockMode::Ex, LockMode::Pw, LockMode::Pr, LockMode::Cr];
        MODES[self.rng.gen_range(0..MODES.len())]
    }

    /// A page-aligned extent inside the first `pages` pages
    pub fn extent(&mut self, pages: u64) -> PolicyData {
        let first = self.rng.gen_range(0..pages);
        let last = self.rng.gen_range(first..pages);
        extent(first * 4096, (last + 1) * 4096 - 1)
    }

    /// Non-empty inode bits from the low `width` bits
    pub fn ibits(&mut self, width: u32) -> PolicyData {
        let max = (1u64 << width) - 1;
        ibits(self.rng.gen_range(1..=max))
    }
}

impl Default for WorkloadGenerator {
    fn default() -> Self {
        Self::new(42)
    }
}

pub fn extent(start: u64, end: u64) -> PolicyData {
    PolicyData::Extent(Extent::new(start, end))
}

pub fn ibits(bits: u64) -> PolicyData {
    PolicyData::Ibits { bits }
}

/// Testing config with `max_unused` unused locks kept per client.
pub fn config_with_cache(max_unused: usize) -> DlmConfig {
    let mut config = DlmConfig::testing();
    config.lru.max_unused = max_unused;
    config
}

/// Testing config with a short maximum lock age.
pub fn config_with_max_age(max_age: Duration) -> DlmConfig {
    let mut config = DlmConfig::testing();
    config.lru.max_age = max_age;
    config
}
