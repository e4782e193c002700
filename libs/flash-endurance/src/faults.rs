//! Diagnostic fault injection.
//!
//! Injected faults exist only to prove that the verify path sees corruption. They are
//! wired in through `Config::simulate_fault_enabled`, and a run that measures a real
//! part must leave that off: the default strategy is `NoFaults`.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use crate::MAX_FAULT_COUNT;

/// Collision retries allowed per requested address.
pub const FAULT_RETRY_FACTOR: u32 = 8;

pub trait FaultInjector {
    /// Absolute addresses to corrupt during this cycle's program pass, sorted and unique.
    fn fault_addresses(&mut self, cycle: u32, region_start: u32, region_size: u32) -> Vec<u32>;

    fn is_active(&self) -> bool;
}

pub struct NoFaults;
impl FaultInjector for NoFaults {
    fn fault_addresses(&mut self, _cycle: u32, _region_start: u32, _region_size: u32) -> Vec<u32> { Vec::new() }

    fn is_active(&self) -> bool { false }
}

/// Pseudo-random fault addresses, reproducible from `(seed, cycle)`.
pub struct SeededFaults {
    seed: u64,
    count: u32,
}
impl SeededFaults {
    pub fn new(seed: u64, count: u32) -> Self { SeededFaults { seed, count: count.min(MAX_FAULT_COUNT) } }
}
impl FaultInjector for SeededFaults {
    fn fault_addresses(&mut self, cycle: u32, region_start: u32, region_size: u32) -> Vec<u32> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ ((cycle as u64) << 32 | cycle as u64));
        select_fault_addresses(&mut rng, self.count, region_start, region_size)
    }

    fn is_active(&self) -> bool { self.count > 0 }
}

/// Pick up to `count` distinct addresses inside `[region_start, region_start + region_size)`.
///
/// Collisions are retried, but the total number of draws is bounded by
/// `count * FAULT_RETRY_FACTOR`, so the result may come up short on a tiny region.
pub fn select_fault_addresses<R: RngCore>(rng: &mut R, count: u32, region_start: u32, region_size: u32) -> Vec<u32> {
    let wanted = count.min(MAX_FAULT_COUNT).min(region_size) as usize;
    let mut picked = BTreeSet::new();
    if wanted == 0 {
        return Vec::new();
    }
    let budget = wanted as u32 * FAULT_RETRY_FACTOR;
    let mut draws = 0;
    while picked.len() < wanted && draws < budget {
        draws += 1;
        let addr = region_start.saturating_add(rng.next_u32() % region_size);
        if !picked.insert(addr) {
            log::trace!(target: "endurance::faults", "fault address collision at {:08x}", addr);
        }
    }
    if picked.len() < wanted {
        log::warn!(target: "endurance::faults", "only placed {} of {} faults", picked.len(), wanted);
    }
    picked.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for count in 1..=MAX_FAULT_COUNT {
            let addrs = select_fault_addresses(&mut rng, count, 0x1_0000, 256);
            assert_eq!(addrs.len(), count as usize);
            assert!(addrs.iter().all(|&a| a >= 0x1_0000 && a < 0x1_0100));
            assert!(addrs.windows(2).all(|w| w[0] < w[1]), "not sorted and unique: {:x?}", addrs);
        }
    }

    #[test]
    fn test_selection_small_region() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        // can't place more faults than there are bytes
        let addrs = select_fault_addresses(&mut rng, 10, 100, 3);
        assert!(addrs.len() <= 3);
        assert!(addrs.iter().all(|&a| a >= 100 && a < 103));
        assert!(select_fault_addresses(&mut rng, 5, 0, 0).is_empty());
        assert!(select_fault_addresses(&mut rng, 0, 0, 4096).is_empty());
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let mut a = SeededFaults::new(42, 6);
        let mut b = SeededFaults::new(42, 6);
        assert_eq!(a.fault_addresses(7, 0x2000, 4096), b.fault_addresses(7, 0x2000, 4096));
        assert!(a.is_active());
        assert!(!NoFaults.is_active());
        assert!(NoFaults.fault_addresses(7, 0x2000, 4096).is_empty());
    }
}
