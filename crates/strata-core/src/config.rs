//! Process-wide storage configuration

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::SampleFormat;

/// Lower bound on a sequence's max block length, in samples
pub const MIN_BLOCK_SAMPLES: usize = 1024;
/// Upper bound on a sequence's max block length, in samples
pub const MAX_BLOCK_SAMPLES: usize = 64 * 1024 * 1024;

static MAX_DISK_BLOCK_SIZE: AtomicUsize = AtomicUsize::new(1048576);

/// Set the target on-disk size of one block file, in bytes.
///
/// Intended to be called once at startup; sequences created afterwards derive
/// their block length bounds from it. Existing sequences are unaffected.
pub fn set_max_disk_block_size(bytes: usize) {
    MAX_DISK_BLOCK_SIZE.store(bytes, Ordering::Relaxed);
}

pub fn max_disk_block_size() -> usize {
    MAX_DISK_BLOCK_SIZE.load(Ordering::Relaxed)
}

/// Longest block, in samples, for a sequence stored in `format`.
/// Clamped to [`MIN_BLOCK_SAMPLES`, `MAX_BLOCK_SAMPLES`].
pub fn max_block_samples(format: SampleFormat) -> usize {
    (max_disk_block_size() / format.bytes()).clamp(MIN_BLOCK_SAMPLES, MAX_BLOCK_SAMPLES)
}
