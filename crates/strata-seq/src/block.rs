//! Block references, the block locator, and the blockifier

use strata_core::{Sample, SampleCount, SampleFormat};
use strata_store::{BlockHandle, BlockStore};

use crate::SeqResult;

/// One element of a sequence's block list: an absolute start position and a
/// handle to the block file holding the samples from there
#[derive(Debug, Clone)]
pub struct BlockRef {
    pub start: SampleCount,
    pub file: BlockHandle,
}

impl BlockRef {
    pub fn new(file: BlockHandle, start: SampleCount) -> Self {
        Self { start, file }
    }

    /// Length in samples
    #[inline]
    pub fn len(&self) -> usize {
        self.file.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }

    /// One past the last sample position this block covers
    #[inline]
    pub fn end(&self) -> SampleCount {
        self.start + self.len() as SampleCount
    }

    /// The same block shifted by `delta` samples
    pub fn shifted(&self, delta: SampleCount) -> Self {
        Self {
            start: self.start + delta,
            file: self.file.clone(),
        }
    }
}

/// Locate the block containing sample position `pos`.
///
/// Interpolation search: block lengths cluster around the ideal size, so
/// position is nearly proportional to block index and guessing by fraction
/// converges in O(log log n) steps for the common case. Block lengths are
/// nonzero, so every miss strictly narrows one side.
///
/// `pos` must satisfy `0 <= pos < total`, where total is the end of the last
/// block.
pub fn find_block(blocks: &[BlockRef], pos: SampleCount) -> usize {
    debug_assert!(!blocks.is_empty());
    if pos == 0 {
        return 0;
    }

    let mut lo = 0usize;
    let mut hi = blocks.len();
    let mut lo_samples: SampleCount = 0;
    let mut hi_samples: SampleCount = blocks[blocks.len() - 1].end();
    debug_assert!(pos >= 0 && pos < hi_samples);

    loop {
        let frac = (pos - lo_samples) as f64 / (hi_samples - lo_samples) as f64;
        let guess = (lo + (frac * (hi - lo) as f64) as usize).min(hi - 1);
        let block = &blocks[guess];

        debug_assert!(block.len() > 0);
        debug_assert!(lo <= guess && guess < hi && lo < hi);

        if pos < block.start {
            debug_assert!(lo != guess);
            hi = guess;
            hi_samples = block.start;
        } else {
            let next_start = block.end();
            if pos < next_start {
                return guess;
            }
            debug_assert!(guess < hi - 1);
            lo = guess + 1;
            lo_samples = next_start;
        }
    }
}

/// Split `buffer` into approximately equal new simple blocks, none longer
/// than `max_samples`, appending them to `list` with starts measured from
/// `start`. Piece lengths are balanced within one sample of each other.
pub fn blockify(
    store: &dyn BlockStore,
    max_samples: usize,
    format: SampleFormat,
    list: &mut Vec<BlockRef>,
    start: SampleCount,
    buffer: &[Sample],
) -> SeqResult<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let num = buffer.len().div_ceil(max_samples);
    list.reserve(num);

    for i in 0..num {
        let offset = i * buffer.len() / num;
        let end = (i + 1) * buffer.len() / num;
        let file = store.new_simple_block(&buffer[offset..end], format)?;
        list.push(BlockRef::new(file, start + offset as SampleCount));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_store::{DiskBlockStore, SilentBlockFile, StoreConfig};
    use tempfile::tempdir;

    fn silent_blocks(lens: &[usize]) -> Vec<BlockRef> {
        let mut start = 0;
        lens.iter()
            .map(|&len| {
                let b = BlockRef::new(SilentBlockFile::new(len), start);
                start += len as SampleCount;
                b
            })
            .collect()
    }

    #[test]
    fn test_find_block_uniform() {
        let blocks = silent_blocks(&[10, 10, 10, 10]);
        assert_eq!(find_block(&blocks, 0), 0);
        assert_eq!(find_block(&blocks, 9), 0);
        assert_eq!(find_block(&blocks, 10), 1);
        assert_eq!(find_block(&blocks, 25), 2);
        assert_eq!(find_block(&blocks, 39), 3);
    }

    #[test]
    fn test_find_block_skewed_lengths() {
        // Interpolation guesses badly here; correctness must survive
        let blocks = silent_blocks(&[1, 1000, 1, 1, 2000, 3]);
        let total: SampleCount = blocks.last().unwrap().end();
        let mut expect = 0usize;
        for pos in 0..total {
            while pos >= blocks[expect].end() {
                expect += 1;
            }
            assert_eq!(find_block(&blocks, pos), expect, "pos {}", pos);
        }
    }

    #[test]
    fn test_find_block_single() {
        let blocks = silent_blocks(&[5]);
        for pos in 0..5 {
            assert_eq!(find_block(&blocks, pos), 0);
        }
    }

    #[test]
    fn test_blockify_balanced() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();

        let buffer: Vec<f32> = (0..25).map(|i| i as f32).collect();
        let mut list = Vec::new();
        blockify(&store, 10, SampleFormat::Float, &mut list, 100, &buffer).unwrap();

        // ceil(25 / 10) = 3 pieces, lengths within one of each other
        assert_eq!(list.len(), 3);
        let lens: Vec<usize> = list.iter().map(|b| b.len()).collect();
        assert_eq!(lens.iter().sum::<usize>(), 25);
        assert!(lens.iter().all(|&l| l == 8 || l == 9));

        // Starts are contiguous from the requested origin
        assert_eq!(list[0].start, 100);
        assert_eq!(list[1].start, list[0].end());
        assert_eq!(list[2].start, list[1].end());

        // Contents survived the split
        let mut out = vec![0.0; list[1].len()];
        list[1].file.read(&mut out, 0, true).unwrap();
        assert_eq!(out[0], list[1].start as f32 - 100.0);
    }

    #[test]
    fn test_blockify_empty_is_noop() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let mut list = Vec::new();
        blockify(&store, 10, SampleFormat::Float, &mut list, 0, &[]).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_blockify_exact_fit() {
        let dir = tempdir().unwrap();
        let store = DiskBlockStore::open(StoreConfig::new(dir.path())).unwrap();
        let mut list = Vec::new();
        blockify(&store, 10, SampleFormat::Float, &mut list, 0, &[0.5; 10]).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].len(), 10);
    }

    #[test]
    fn test_shifted() {
        let b = BlockRef::new(SilentBlockFile::new(7), 40);
        let s = b.shifted(-5);
        assert_eq!(s.start, 35);
        assert_eq!(s.end(), 42);
        assert_eq!(Arc::strong_count(&b.file), 2);
    }
}
