//! Seed derivation shared by trial setup and noisy rate pipelines.

pub(crate) const TRIAL_STREAM: u64 = 0x7472_6961;
pub(crate) const RANGE_STREAM: u64 = 0x7261_6e67;

pub(crate) fn derive_seed(base_seed: u64, stream: u64, index: u32) -> u64 {
    let mixed = base_seed ^ (stream << 32) ^ stream.rotate_right(17) ^ index as u64;
    splitmix64(mixed)
}

pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Stable 64-bit FNV-1a, used to turn schedule names into seed streams.
pub(crate) fn fnv1a(text: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }
    hash
}
