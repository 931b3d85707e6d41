//! The block-file trait and summary data
//!
//! Summaries are (min, max, rms) triples over fixed strides of 256 and
//! 65536 samples, plus one whole-block triple. They make zoomed-out waveform
//! display cheap: a pixel column covering thousands of samples folds a few
//! triples instead of rescanning raw data.

use std::sync::Arc;

use strata_core::{Sample, XmlWriter};

use crate::StoreResult;

/// Samples per entry of the fine summary
pub const SUMMARY_256: usize = 256;
/// Samples per entry of the coarse summary
pub const SUMMARY_64K: usize = 65536;

/// One (min, max, rms) triple
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MinMaxRms {
    pub min: f32,
    pub max: f32,
    pub rms: f32,
}

/// Precomputed summaries of one block's samples
#[derive(Debug, Clone, Default)]
pub struct SummaryData {
    pub all: MinMaxRms,
    pub s256: Vec<MinMaxRms>,
    pub s64k: Vec<MinMaxRms>,
}

impl SummaryData {
    pub fn compute(samples: &[Sample]) -> Self {
        Self {
            all: fold_triple(samples),
            s256: samples.chunks(SUMMARY_256).map(fold_triple).collect(),
            s64k: samples.chunks(SUMMARY_64K).map(fold_triple).collect(),
        }
    }

    /// Summary for an all-zero block of any length
    pub fn silent(len: usize) -> Self {
        Self {
            all: MinMaxRms::default(),
            s256: vec![MinMaxRms::default(); len.div_ceil(SUMMARY_256)],
            s64k: vec![MinMaxRms::default(); len.div_ceil(SUMMARY_64K)],
        }
    }
}

pub(crate) fn fold_triple(samples: &[Sample]) -> MinMaxRms {
    if samples.is_empty() {
        return MinMaxRms::default();
    }
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    let mut sumsq = 0.0f64;
    for &v in samples {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
        sumsq += (v as f64) * (v as f64);
    }
    MinMaxRms {
        min,
        max,
        rms: (sumsq / samples.len() as f64).sqrt() as f32,
    }
}

/// Copy `out.len()` triples of `summary` starting at `offset`, zero-filling
/// past the end. Returns false when nothing was available.
pub(crate) fn copy_triples(summary: &[MinMaxRms], offset: usize, out: &mut [MinMaxRms]) -> bool {
    let avail = summary.len().saturating_sub(offset);
    let n = avail.min(out.len());
    out[..n].copy_from_slice(&summary[offset..offset + n]);
    out[n..].fill(MinMaxRms::default());
    n > 0 || out.is_empty()
}

/// A reference-counted handle to a block file
pub type BlockHandle = Arc<dyn BlockFile>;

/// One immutable run of samples backed by storage.
///
/// Implementations never change their sample contents once created; editing
/// a block means creating a new file and swapping handles. All methods are
/// callable from any thread.
pub trait BlockFile: Send + Sync + std::fmt::Debug {
    /// Length in samples
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `out.len()` samples starting at `offset` within the block.
    ///
    /// With `strict`, any shortfall is an error. Without it, the unread tail
    /// is zero-filled and the count actually read is returned; display paths
    /// rely on this never failing.
    fn read(&self, out: &mut [Sample], offset: usize, strict: bool) -> StoreResult<usize>;

    /// Whole-block min/max/rms from the precomputed summary.
    /// Zeros when the summary is not yet available.
    fn min_max_rms(&self) -> MinMaxRms;

    /// Min/max/rms of a sub-range, computed by scanning samples
    fn min_max_rms_range(&self, offset: usize, len: usize, strict: bool)
        -> StoreResult<MinMaxRms>;

    /// Read 256-stride summary triples; `offset` counts triples.
    /// Zero-fills and returns false on failure.
    fn read_256(&self, out: &mut [MinMaxRms], offset: usize) -> bool;

    /// Read 64K-stride summary triples; `offset` counts triples.
    fn read_64k(&self, out: &mut [MinMaxRms], offset: usize) -> bool;

    /// False while an on-demand summary computation is still pending
    fn summary_available(&self) -> bool {
        true
    }

    /// False while an on-demand decode is still pending
    fn data_available(&self) -> bool {
        true
    }

    /// True when the samples live in an externally-owned media file
    fn is_alias(&self) -> bool {
        false
    }

    /// Storage encoding, for blocks that own project-local sample data
    fn storage_format(&self) -> Option<strata_core::SampleFormat> {
        None
    }

    /// Project-local bytes this block occupies on disk
    fn storage_bytes(&self) -> u64;

    /// Shrink the reported length. Only the descriptor writer calls this,
    /// to clamp a corrupt overlong block.
    fn set_length(&self, len: usize);

    /// Pin the backing file so it survives shared-project saves
    fn lock(&self);

    /// Pin the backing file across project close
    fn close_lock(&self);

    fn unlock(&self);

    fn is_locked(&self) -> bool;

    /// Emit this block's descriptor element (child of `<waveblock>`)
    fn write_xml(&self, w: &mut XmlWriter);

    /// Short name for log messages
    fn display_name(&self) -> String;
}
