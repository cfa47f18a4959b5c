//! 32-bit FNV-1a, the segmentation hash of the replication protocol.
//! Servers and every SDK must agree on these bits exactly, or percentage
//! rollouts would re-shuffle users between implementations.

const OFFSET_BASIS: u32 = 0x811C9DC5;
const PRIME: u32 = 0x01000193;

/// Hash `input` as UTF-8 bytes. The empty string hashes to the offset basis.
pub fn fnv1a(input: &str) -> u32 {
    input
        .bytes()
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}

/// Project `input` onto the unit interval `[0, 1)` by dividing its 32-bit
/// hash by 2^32.
pub fn fnv1a_unit(input: &str) -> f64 {
    f64::from(fnv1a(input)) / 4_294_967_296.0
}
