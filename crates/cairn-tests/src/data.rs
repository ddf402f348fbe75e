//! Deterministic test data.

/// `pattern` repeated until `len` bytes.
pub fn repeated(pattern: &[u8], len: usize) -> Vec<u8> {
    pattern.iter().copied().cycle().take(len).collect()
}

/// Seeded pseudo-random bytes (xorshift64). A zero seed is remapped.
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}
