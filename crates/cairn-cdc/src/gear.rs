//! Gear table for the rolling hash.

use std::sync::LazyLock;

/// One pseudo-random 64-bit value per byte value.
pub type GearTable = [u64; 256];

/// Shared table, built on first use.
pub static GEAR_TABLE: LazyLock<GearTable> = LazyLock::new(gear_table);

/// Builds the gear table.
///
/// Entry `b` is the first 8 bytes of `BLAKE3([b])` read as a little-endian
/// u64, which makes the table reproducible on every platform without
/// shipping a literal array.
pub fn gear_table() -> GearTable {
    let mut table = [0u64; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        let digest = blake3::hash(&[byte as u8]);
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        *slot = u64::from_le_bytes(word);
    }
    table
}
