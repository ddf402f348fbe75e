//! FastCDC-style chunking over in-memory data.
//!
//! A gear rolling hash is updated byte by byte once `min_size` bytes have
//! accumulated. A boundary fires when `hash & mask == 0`. The stricter mask
//! (`mask_s`) applies before the target size and the looser one (`mask_l`)
//! after it, which pulls chunk sizes toward the target.

use crate::gear::{GearTable, GEAR_TABLE};
use crate::params::{CHUNK_MAX_SIZE, CHUNK_MIN_SIZE, CHUNK_TARGET_SIZE};
use crate::ParamsError;

/// Parameters for the chunking algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingParams {
    /// Minimum chunk size in bytes
    pub min_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
    /// Target average chunk size
    pub avg_size: usize,
    /// Mask for positions before the target size
    pub mask_s: u64,
    /// Mask for positions at/after the target size
    pub mask_l: u64,
}

impl ChunkingParams {
    /// Validates sizes and derives both masks from `target`.
    ///
    /// With `bits = floor(log2(target))`, `mask_s` has `bits + 1` low bits
    /// set and `mask_l` has `bits - 1`.
    pub fn new(min: usize, target: usize, max: usize) -> Result<Self, ParamsError> {
        if min == 0 {
            return Err(ParamsError::ZeroMinSize);
        }
        if !(min <= target && target <= max) {
            return Err(ParamsError::Unordered { min, target, max });
        }

        let bits = target.ilog2();
        let mask_s = u64::MAX >> (63 - bits);
        let mask_l = (1u64 << bits.saturating_sub(1)) - 1;

        Ok(Self {
            min_size: min,
            max_size: max,
            avg_size: target,
            mask_s,
            mask_l,
        })
    }
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            min_size: CHUNK_MIN_SIZE,
            max_size: CHUNK_MAX_SIZE,
            avg_size: CHUNK_TARGET_SIZE,
            mask_s: (1 << 11) - 1,
            mask_l: (1 << 9) - 1,
        }
    }
}

/// Represents a chunk boundary with start and end offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    /// Start offset (inclusive)
    pub start: usize,
    /// End offset (exclusive)
    pub end: usize,
}

impl ChunkBoundary {
    /// Returns the size of this chunk.
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Returns true if this chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Length of the next chunk at the start of `window`.
///
/// `window` holds the bytes from the chunk start up to `max_size` bytes, or
/// up to end of input when less remains. A window of at most `min_size`
/// bytes is emitted whole; otherwise the first hash hit past `min_size`
/// cuts, and a window without a hit is cut at its end.
pub(crate) fn cut_point(window: &[u8], params: &ChunkingParams, gear: &GearTable) -> usize {
    if window.len() <= params.min_size {
        return window.len();
    }

    let mut hash = 0u64;
    for (i, &byte) in window.iter().enumerate().skip(params.min_size) {
        hash = (hash << 1).wrapping_add(gear[byte as usize]);

        let mask = if i < params.avg_size {
            params.mask_s
        } else {
            params.mask_l
        };

        if hash & mask == 0 {
            // A hit at byte i ends the chunk after it
            return i + 1;
        }
    }

    window.len()
}

/// Chunks data with default parameters.
///
/// Returns end-exclusive boundary offsets starting with 0.
///
/// # Example
/// ```
/// use cairn_cdc::chunk;
///
/// let data = vec![7u8; 10_000];
/// let boundaries = chunk(&data);
///
/// assert_eq!(boundaries[0], 0);
/// assert_eq!(*boundaries.last().unwrap(), data.len());
/// ```
pub fn chunk(data: &[u8]) -> Vec<usize> {
    chunk_with_params(data, &ChunkingParams::default())
}

/// Chunks data with custom parameters.
///
/// Boundaries are `[0, b1, ..., len]`. Empty input yields `[0]`, meaning
/// zero chunks.
pub fn chunk_with_params(data: &[u8], params: &ChunkingParams) -> Vec<usize> {
    let mut boundaries = vec![0];
    boundaries.extend(FastCdcChunker::with_params(data, *params).map(|b| b.end));
    boundaries
}

/// Lazy chunker over a byte slice.
///
/// The sequence is a pure function of the input and the parameters, so a
/// fresh iterator over the same bytes reproduces it exactly.
pub struct FastCdcChunker<'a> {
    data: &'a [u8],
    params: ChunkingParams,
    position: usize,
}

impl<'a> FastCdcChunker<'a> {
    /// Creates a new chunker with default parameters.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_params(data, ChunkingParams::default())
    }

    /// Creates a new chunker with custom parameters.
    pub fn with_params(data: &'a [u8], params: ChunkingParams) -> Self {
        Self {
            data,
            params,
            position: 0,
        }
    }

    /// Returns the current position in the data.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the remaining bytes to be chunked.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}

impl Iterator for FastCdcChunker<'_> {
    type Item = ChunkBoundary;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.data.len() {
            return None;
        }

        let start = self.position;
        let window_end = start.saturating_add(self.params.max_size).min(self.data.len());
        let len = cut_point(&self.data[start..window_end], &self.params, &GEAR_TABLE);

        self.position = start + len;
        Some(ChunkBoundary {
            start,
            end: self.position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (state >> 33) as u8
            })
            .collect()
    }

    fn small_params() -> ChunkingParams {
        ChunkingParams::new(256, 1024, 4096).unwrap()
    }

    #[test]
    fn test_empty_data() {
        assert_eq!(chunk(&[]), vec![0]);
        assert_eq!(FastCdcChunker::new(&[]).count(), 0);
    }

    #[test]
    fn test_small_data_single_chunk() {
        let data = vec![0u8; 100];
        assert_eq!(chunk(&data), vec![0, 100]);
    }

    #[test]
    fn test_exactly_min_size_single_chunk() {
        let data = vec![0u8; CHUNK_MIN_SIZE];
        assert_eq!(chunk(&data), vec![0, CHUNK_MIN_SIZE]);
    }

    #[test]
    fn test_params_derive_masks() {
        let params = ChunkingParams::new(256, 1024, 4096).unwrap();
        assert_eq!(params.mask_s, (1 << 11) - 1);
        assert_eq!(params.mask_l, (1 << 9) - 1);

        // Non power of two rounds down
        let params = ChunkingParams::new(100, 1500, 3000).unwrap();
        assert_eq!(params.mask_s, (1 << 11) - 1);
        assert_eq!(params.mask_l, (1 << 9) - 1);

        assert_eq!(
            ChunkingParams::new(CHUNK_MIN_SIZE, CHUNK_TARGET_SIZE, CHUNK_MAX_SIZE).unwrap(),
            ChunkingParams::default()
        );
    }

    #[test]
    fn test_params_masks_at_extremes() {
        let params = ChunkingParams::new(1, 1, 1).unwrap();
        assert_eq!(params.mask_s, 1);
        assert_eq!(params.mask_l, 0);

        let top = 1usize << (usize::BITS - 1);
        let params = ChunkingParams::new(1, top, usize::MAX).unwrap();
        assert_eq!(params.mask_s.count_ones(), usize::BITS);
        assert_eq!(params.mask_l.count_ones(), usize::BITS - 2);

        // Sizes that large still chunk: nothing cuts before the end
        let data = pseudo_random(4096, 9);
        assert_eq!(chunk_with_params(&data, &params), vec![0, data.len()]);
    }

    #[test]
    fn test_params_rejected() {
        assert_eq!(ChunkingParams::new(0, 10, 20), Err(ParamsError::ZeroMinSize));
        assert!(matches!(
            ChunkingParams::new(64, 32, 128),
            Err(ParamsError::Unordered { .. })
        ));
        assert!(matches!(
            ChunkingParams::new(64, 256, 128),
            Err(ParamsError::Unordered { .. })
        ));
    }

    #[test]
    fn test_size_bounds() {
        let params = small_params();
        let data = pseudo_random(200_000, 0x12345678);
        let boundaries = chunk_with_params(&data, &params);

        let sizes: Vec<usize> = boundaries.windows(2).map(|w| w[1] - w[0]).collect();
        let (last, body) = sizes.split_last().unwrap();
        for (i, size) in body.iter().enumerate() {
            assert!(
                *size >= params.min_size && *size <= params.max_size,
                "chunk {} has size {}",
                i,
                size
            );
        }
        assert!(*last <= params.max_size);
        assert!(sizes.len() > 20, "expected many chunks, got {}", sizes.len());
    }

    #[test]
    fn test_forced_cut_at_max() {
        // Constant input never satisfies the mask past the first window
        let params = small_params();
        let data = vec![0x42u8; params.max_size * 3];
        let boundaries = chunk_with_params(&data, &params);
        for w in boundaries.windows(2) {
            assert!(w[1] - w[0] <= params.max_size);
        }
        assert_eq!(*boundaries.last().unwrap(), data.len());
    }

    #[test]
    fn test_determinism() {
        let data = pseudo_random(50_000, 7);
        assert_eq!(
            chunk_with_params(&data, &small_params()),
            chunk_with_params(&data, &small_params())
        );
    }

    #[test]
    fn test_iterator_tiles_input() {
        let data = pseudo_random(30_000, 99);
        let chunks: Vec<ChunkBoundary> = FastCdcChunker::with_params(&data, small_params()).collect();

        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, data.len());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(!pair[0].is_empty());
        }
    }

    #[test]
    fn test_iterator_matches_boundaries() {
        let data = pseudo_random(40_000, 3);
        let params = small_params();
        let from_iter: Vec<usize> = std::iter::once(0)
            .chain(FastCdcChunker::with_params(&data, params).map(|b| b.end))
            .collect();
        assert_eq!(from_iter, chunk_with_params(&data, &params));
    }

    #[test]
    fn test_insertion_keeps_later_boundaries() {
        let params = small_params();
        let base = pseudo_random(100_000, 42);
        let mut edited = vec![0xFFu8; 37];
        edited.extend_from_slice(&base);

        let base_ends: Vec<usize> = chunk_with_params(&base, &params);
        let shifted: Vec<usize> = chunk_with_params(&edited, &params)
            .into_iter()
            .filter(|b| *b >= 37)
            .map(|b| b - 37)
            .collect();

        // Boundaries resynchronise after the edit
        let common = base_ends.iter().filter(|b| shifted.contains(b)).count();
        assert!(
            common * 2 > base_ends.len(),
            "only {} of {} boundaries survived",
            common,
            base_ends.len()
        );
    }

    #[test]
    fn test_repeating_pattern_scenario() {
        let data: Vec<u8> = b"ab".iter().copied().cycle().take(10_000).collect();
        let boundaries = chunk_with_params(&data, &small_params());
        assert!(boundaries.len() >= 3, "expected at least two chunks");
        assert_eq!(*boundaries.last().unwrap(), 10_000);
    }
}
