use bytemuck::{Pod, Zeroable};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Sampling dimensions covered by the tables.
pub const HALTON_DIMENSIONS: usize = 64;

const PERMUTATION_SEED: u64 = 0x5eed_ba5e;

/// One Halton dimension: its prime base and where its digit permutation starts in the
/// concatenated permutation table.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HaltonEntry {
    pub base: u32,
    pub permutation_offset: u32,
}

/// Tables for a randomly digit-permuted Halton sequence.
pub struct HaltonTables {
    pub entries: Vec<HaltonEntry>,
    /// Digit permutations of every base back to back, `base` values each.
    pub permutations: Vec<u16>,
}

/// The first `count` primes.
pub fn primes(count: usize) -> Vec<u32> {
    let mut primes: Vec<u32> = Vec::with_capacity(count);
    let mut candidate = 2;
    while primes.len() < count {
        if primes
            .iter()
            .take_while(|&&p| p * p <= candidate)
            .all(|&p| candidate % p != 0)
        {
            primes.push(candidate);
        }
        candidate += 1;
    }
    primes
}

impl HaltonTables {
    pub fn new(dimensions: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut entries = Vec::with_capacity(dimensions);
        let mut permutations = Vec::new();
        for base in primes(dimensions) {
            entries.push(HaltonEntry {
                base,
                permutation_offset: permutations.len() as u32,
            });
            let start = permutations.len();
            permutations.extend(0..base as u16);
            permutations[start..].shuffle(&mut rng);
        }
        Self {
            entries,
            permutations,
        }
    }

    /// Reference evaluation of dimension `dimension` at `index`, as the shaders compute it.
    pub fn sample(&self, dimension: usize, mut index: u64) -> f32 {
        let entry = self.entries[dimension];
        let base = entry.base as u64;
        let permutation = &self.permutations[entry.permutation_offset as usize..];
        let inv_base = 1.0 / base as f64;
        let mut inv_base_n = 1.0;
        let mut reversed = 0u64;
        while index > 0 {
            let next = index / base;
            let digit = index - next * base;
            reversed = reversed * base + permutation[digit as usize] as u64;
            inv_base_n *= inv_base;
            index = next;
        }
        ((reversed as f64 * inv_base_n) as f32).min(1.0 - f32::EPSILON)
    }
}

impl Default for HaltonTables {
    fn default() -> Self {
        Self::new(HALTON_DIMENSIONS, PERMUTATION_SEED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_primes() {
        assert_eq!(primes(8), vec![2, 3, 5, 7, 11, 13, 17, 19]);
        assert_eq!(*primes(64).last().unwrap(), 311);
    }

    #[test]
    fn offsets_follow_the_bases() {
        let tables = HaltonTables::default();
        assert_eq!(tables.entries.len(), HALTON_DIMENSIONS);
        let mut expected = 0;
        for entry in &tables.entries {
            assert_eq!(entry.permutation_offset, expected);
            expected += entry.base;
        }
        assert_eq!(tables.permutations.len(), expected as usize);
    }

    #[test]
    fn every_permutation_is_a_permutation() {
        let tables = HaltonTables::default();
        for entry in &tables.entries {
            let start = entry.permutation_offset as usize;
            let mut digits = tables.permutations[start..start + entry.base as usize].to_vec();
            digits.sort_unstable();
            assert!(digits.iter().enumerate().all(|(i, d)| i == *d as usize));
        }
    }

    #[test]
    fn tables_are_deterministic_per_seed() {
        let a = HaltonTables::new(16, 7);
        let b = HaltonTables::new(16, 7);
        assert_eq!(a.permutations, b.permutations);
    }

    #[test]
    fn samples_stay_in_the_unit_interval() {
        let tables = HaltonTables::default();
        for dimension in [0, 1, 17, 63] {
            for index in 0..256 {
                let value = tables.sample(dimension, index);
                assert!((0.0..1.0).contains(&value));
            }
        }
    }
}
