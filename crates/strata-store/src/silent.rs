//! Silent block files: implicit zeros, no storage

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::{Sample, XmlWriter};

use crate::{BlockFile, MinMaxRms, StoreError, StoreResult};

#[derive(Debug)]
pub struct SilentBlockFile {
    len: AtomicUsize,
    locked: AtomicBool,
}

impl SilentBlockFile {
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            len: AtomicUsize::new(len),
            locked: AtomicBool::new(false),
        })
    }
}

impl BlockFile for SilentBlockFile {
    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn read(&self, out: &mut [Sample], offset: usize, strict: bool) -> StoreResult<usize> {
        let len = self.len();
        out.fill(0.0);
        if offset + out.len() > len {
            if strict {
                return Err(StoreError::ReadPastEnd {
                    offset,
                    len: out.len(),
                    block_len: len,
                });
            }
            return Ok(len.saturating_sub(offset));
        }
        Ok(out.len())
    }

    fn min_max_rms(&self) -> MinMaxRms {
        MinMaxRms::default()
    }

    fn min_max_rms_range(
        &self,
        _offset: usize,
        _len: usize,
        _strict: bool,
    ) -> StoreResult<MinMaxRms> {
        Ok(MinMaxRms::default())
    }

    fn read_256(&self, out: &mut [MinMaxRms], _offset: usize) -> bool {
        out.fill(MinMaxRms::default());
        true
    }

    fn read_64k(&self, out: &mut [MinMaxRms], _offset: usize) -> bool {
        out.fill(MinMaxRms::default());
        true
    }

    fn storage_bytes(&self) -> u64 {
        0
    }

    fn set_length(&self, len: usize) {
        self.len.store(len, Ordering::Relaxed);
    }

    fn lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    fn close_lock(&self) {
        self.locked.store(true, Ordering::Release);
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn write_xml(&self, w: &mut XmlWriter) {
        w.start_tag("silentblockfile");
        w.attr_u64("len", self.len() as u64);
        w.end_tag("silentblockfile");
    }

    fn display_name(&self) -> String {
        format!("silence({})", self.len())
    }
}
