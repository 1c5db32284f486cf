#![allow(dead_code)]

use std::path::PathBuf;

use oems_sort::{HostBackend, OemsSorter, SorterConfig};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Kernel source shipped with the crate.
pub fn kernel_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders/oems.metal")
}

/// Validation is forced on so every test also exercises the binding checks.
pub fn host_config() -> SorterConfig {
    SorterConfig::new(kernel_path()).with_validation(true)
}

pub fn host_sorter() -> OemsSorter<HostBackend> {
    OemsSorter::new(HostBackend::new(), host_config()).unwrap()
}

pub fn host_sorter_with(config: SorterConfig) -> OemsSorter<HostBackend> {
    OemsSorter::new(HostBackend::new(), config).unwrap()
}

/// `n` floats drawn uniformly from `[lo, hi]`.
pub fn uniform_floats(rng: &mut ChaCha8Rng, n: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(lo..=hi)).collect()
}

/// Reference result: the input sorted with `total_cmp`.
pub fn reference_sorted(data: &[f32]) -> Vec<f32> {
    let mut expected = data.to_vec();
    expected.sort_by(f32::total_cmp);
    expected
}

/// Compare two f32 slices via to_bits().
pub fn assert_bits_eq(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert_eq!(
            a.to_bits(),
            e.to_bits(),
            "bit mismatch at index {i}: actual={a} (0x{:08x}), expected={e} (0x{:08x})",
            a.to_bits(),
            e.to_bits(),
        );
    }
}

pub fn is_non_decreasing(data: &[f32]) -> bool {
    data.windows(2).all(|w| w[0] <= w[1])
}

/// Whether `a` and `b` hold the same multiset of bit patterns.
pub fn is_permutation(a: &[f32], b: &[f32]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_bits: Vec<u32> = a.iter().map(|v| v.to_bits()).collect();
    let mut b_bits: Vec<u32> = b.iter().map(|v| v.to_bits()).collect();
    a_bits.sort_unstable();
    b_bits.sort_unstable();
    a_bits == b_bits
}
