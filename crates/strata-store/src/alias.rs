//! Alias and on-demand block files
//!
//! An alias block's samples live in an externally-owned WAV file; the block
//! records only (path, start offset, length, channel). On-demand variants
//! defer part of the work to a background task: the summary for
//! [`OnDemandAliasBlockFile`], the sample data itself for
//! [`OnDemandDecodeBlockFile`]. Until the task runs, the availability flags
//! report false and lenient readers see zeros.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use strata_core::{Sample, XmlWriter};

use crate::block::fold_triple;
use crate::{BlockFile, MinMaxRms, StoreError, StoreResult, SummaryData};

/// Read `out.len()` samples of one channel from a WAV file, starting at
/// `start_frame`. Returns the number of frames actually read; the tail of
/// `out` is zero-filled on a short read.
fn read_wav_channel(
    path: &Path,
    channel: u16,
    start_frame: u64,
    out: &mut [Sample],
) -> StoreResult<usize> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channel as usize >= channels {
        return Err(StoreError::Wav(format!(
            "channel {} out of range for {}-channel file {}",
            channel,
            channels,
            path.display()
        )));
    }
    reader.seek(start_frame as u32)?;

    let mut n = 0usize;
    match spec.sample_format {
        hound::SampleFormat::Float => {
            let mut samples = reader.samples::<f32>();
            'frames: while n < out.len() {
                let mut picked = None;
                for ch in 0..channels {
                    match samples.next() {
                        Some(s) => {
                            let v = s?;
                            if ch == channel as usize {
                                picked = Some(v);
                            }
                        }
                        None => break 'frames,
                    }
                }
                out[n] = picked.unwrap_or(0.0);
                n += 1;
            }
        }
        hound::SampleFormat::Int => {
            let scale = ((1u32 << (spec.bits_per_sample - 1)) - 1) as f32;
            let mut samples = reader.samples::<i32>();
            'frames: while n < out.len() {
                let mut picked = None;
                for ch in 0..channels {
                    match samples.next() {
                        Some(s) => {
                            let v = s?;
                            if ch == channel as usize {
                                picked = Some(v as f32 / scale);
                            }
                        }
                        None => break 'frames,
                    }
                }
                out[n] = picked.unwrap_or(0.0);
                n += 1;
            }
        }
    }
    out[n..].fill(0.0);
    Ok(n)
}

fn read_region(path: &Path, channel: u16, offset: u64, len: usize) -> StoreResult<Vec<Sample>> {
    let mut buf = vec![0.0; len];
    read_wav_channel(path, channel, offset, &mut buf)?;
    Ok(buf)
}

macro_rules! lock_impls {
    () => {
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
    };
}

// ---------------------------------------------------------------------------
// AliasBlockFile
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AliasBlockFile {
    path: PathBuf,
    offset: u64,
    len: usize,
    channel: u16,
    summary: SummaryData,
    locked: AtomicBool,
}

impl AliasBlockFile {
    /// Create an alias onto `path`, reading the aliased region once to
    /// compute its summaries
    pub fn new(path: PathBuf, offset: u64, len: usize, channel: u16) -> StoreResult<Arc<Self>> {
        let samples = read_region(&path, channel, offset, len)?;
        Ok(Arc::new(Self {
            path,
            offset,
            len,
            channel,
            summary: SummaryData::compute(&samples),
            locked: AtomicBool::new(false),
        }))
    }
}

impl BlockFile for AliasBlockFile {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, out: &mut [Sample], offset: usize, strict: bool) -> StoreResult<usize> {
        if offset + out.len() > self.len {
            if strict {
                return Err(StoreError::ReadPastEnd {
                    offset,
                    len: out.len(),
                    block_len: self.len,
                });
            }
            out.fill(0.0);
            let avail = self.len.saturating_sub(offset);
            if avail == 0 {
                return Ok(0);
            }
            return read_wav_channel(
                &self.path,
                self.channel,
                self.offset + offset as u64,
                &mut out[..avail],
            )
            .or(Ok(0));
        }
        match read_wav_channel(&self.path, self.channel, self.offset + offset as u64, out) {
            Ok(n) => Ok(n),
            Err(e) if strict => Err(e),
            Err(_) => {
                out.fill(0.0);
                Ok(0)
            }
        }
    }

    fn min_max_rms(&self) -> MinMaxRms {
        self.summary.all
    }

    fn min_max_rms_range(
        &self,
        offset: usize,
        len: usize,
        strict: bool,
    ) -> StoreResult<MinMaxRms> {
        let mut buf = vec![0.0; len];
        match self.read(&mut buf, offset, strict) {
            Ok(_) => Ok(fold_triple(&buf)),
            Err(e) if strict => Err(e),
            Err(_) => Ok(MinMaxRms::default()),
        }
    }

    fn read_256(&self, out: &mut [MinMaxRms], offset: usize) -> bool {
        crate::block::copy_triples(&self.summary.s256, offset, out)
    }

    fn read_64k(&self, out: &mut [MinMaxRms], offset: usize) -> bool {
        crate::block::copy_triples(&self.summary.s64k, offset, out)
    }

    fn is_alias(&self) -> bool {
        true
    }

    fn storage_bytes(&self) -> u64 {
        0
    }

    fn set_length(&self, _len: usize) {
        // Alias lengths are fixed by the external media
    }

    lock_impls!();

    fn write_xml(&self, w: &mut XmlWriter) {
        w.start_tag("aliasblockfile");
        w.attr_str("path", &self.path.to_string_lossy());
        w.attr_u64("offset", self.offset);
        w.attr_u64("len", self.len as u64);
        w.attr_u64("channel", self.channel as u64);
        w.end_tag("aliasblockfile");
    }

    fn display_name(&self) -> String {
        format!("alias:{}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// OnDemandAliasBlockFile
// ---------------------------------------------------------------------------

/// Alias block whose summaries are computed later by a background task
#[derive(Debug)]
pub struct OnDemandAliasBlockFile {
    path: PathBuf,
    offset: u64,
    len: usize,
    channel: u16,
    summary: RwLock<Option<SummaryData>>,
    locked: AtomicBool,
}

impl OnDemandAliasBlockFile {
    pub fn new(path: PathBuf, offset: u64, len: usize, channel: u16) -> Arc<Self> {
        Arc::new(Self {
            path,
            offset,
            len,
            channel,
            summary: RwLock::new(None),
            locked: AtomicBool::new(false),
        })
    }

    /// Background-task entry point: read the aliased region and fill in the
    /// summaries. Idempotent.
    pub fn compute_summary(&self) -> StoreResult<()> {
        if self.summary.read().is_some() {
            return Ok(());
        }
        let samples = read_region(&self.path, self.channel, self.offset, self.len)?;
        *self.summary.write() = Some(SummaryData::compute(&samples));
        Ok(())
    }
}

impl BlockFile for OnDemandAliasBlockFile {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, out: &mut [Sample], offset: usize, strict: bool) -> StoreResult<usize> {
        if offset + out.len() > self.len {
            if strict {
                return Err(StoreError::ReadPastEnd {
                    offset,
                    len: out.len(),
                    block_len: self.len,
                });
            }
            out.fill(0.0);
            return Ok(0);
        }
        match read_wav_channel(&self.path, self.channel, self.offset + offset as u64, out) {
            Ok(n) => Ok(n),
            Err(e) if strict => Err(e),
            Err(_) => {
                out.fill(0.0);
                Ok(0)
            }
        }
    }

    fn min_max_rms(&self) -> MinMaxRms {
        self.summary
            .read()
            .as_ref()
            .map(|s| s.all)
            .unwrap_or_default()
    }

    fn min_max_rms_range(
        &self,
        offset: usize,
        len: usize,
        strict: bool,
    ) -> StoreResult<MinMaxRms> {
        let mut buf = vec![0.0; len];
        match self.read(&mut buf, offset, strict) {
            Ok(_) => Ok(fold_triple(&buf)),
            Err(e) if strict => Err(e),
            Err(_) => Ok(MinMaxRms::default()),
        }
    }

    fn read_256(&self, out: &mut [MinMaxRms], offset: usize) -> bool {
        match self.summary.read().as_ref() {
            Some(s) => crate::block::copy_triples(&s.s256, offset, out),
            None => {
                out.fill(MinMaxRms::default());
                false
            }
        }
    }

    fn read_64k(&self, out: &mut [MinMaxRms], offset: usize) -> bool {
        match self.summary.read().as_ref() {
            Some(s) => crate::block::copy_triples(&s.s64k, offset, out),
            None => {
                out.fill(MinMaxRms::default());
                false
            }
        }
    }

    fn summary_available(&self) -> bool {
        self.summary.read().is_some()
    }

    fn is_alias(&self) -> bool {
        true
    }

    fn storage_bytes(&self) -> u64 {
        0
    }

    fn set_length(&self, _len: usize) {}

    lock_impls!();

    fn write_xml(&self, w: &mut XmlWriter) {
        w.start_tag("odaliasblockfile");
        w.attr_str("path", &self.path.to_string_lossy());
        w.attr_u64("offset", self.offset);
        w.attr_u64("len", self.len as u64);
        w.attr_u64("channel", self.channel as u64);
        w.end_tag("odaliasblockfile");
    }

    fn display_name(&self) -> String {
        format!("od-alias:{}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// OnDemandDecodeBlockFile
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Decoded {
    samples: Vec<Sample>,
    summary: SummaryData,
}

/// Block over external media whose samples require a background decode.
/// Until [`decode`](Self::decode) runs, neither data nor summary exists.
#[derive(Debug)]
pub struct OnDemandDecodeBlockFile {
    path: PathBuf,
    offset: u64,
    len: usize,
    channel: u16,
    decode_type: u16,
    decoded: RwLock<Option<Decoded>>,
    locked: AtomicBool,
}

impl OnDemandDecodeBlockFile {
    pub fn new(
        path: PathBuf,
        offset: u64,
        len: usize,
        channel: u16,
        decode_type: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            path,
            offset,
            len,
            channel,
            decode_type,
            decoded: RwLock::new(None),
            locked: AtomicBool::new(false),
        })
    }

    /// Background-task entry point: decode the media region, keeping the
    /// samples and their summaries in memory. Idempotent.
    pub fn decode(&self) -> StoreResult<()> {
        if self.decoded.read().is_some() {
            return Ok(());
        }
        let samples = read_region(&self.path, self.channel, self.offset, self.len)?;
        let summary = SummaryData::compute(&samples);
        *self.decoded.write() = Some(Decoded { samples, summary });
        Ok(())
    }

    pub fn decode_type(&self) -> u16 {
        self.decode_type
    }
}

impl BlockFile for OnDemandDecodeBlockFile {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, out: &mut [Sample], offset: usize, strict: bool) -> StoreResult<usize> {
        if offset + out.len() > self.len {
            if strict {
                return Err(StoreError::ReadPastEnd {
                    offset,
                    len: out.len(),
                    block_len: self.len,
                });
            }
            out.fill(0.0);
            return Ok(0);
        }
        match self.decoded.read().as_ref() {
            Some(d) => {
                out.copy_from_slice(&d.samples[offset..offset + out.len()]);
                Ok(out.len())
            }
            None if strict => Err(StoreError::NotYetAvailable),
            None => {
                out.fill(0.0);
                Ok(0)
            }
        }
    }

    fn min_max_rms(&self) -> MinMaxRms {
        self.decoded
            .read()
            .as_ref()
            .map(|d| d.summary.all)
            .unwrap_or_default()
    }

    fn min_max_rms_range(
        &self,
        offset: usize,
        len: usize,
        strict: bool,
    ) -> StoreResult<MinMaxRms> {
        match self.decoded.read().as_ref() {
            Some(d) if offset + len <= d.samples.len() => {
                Ok(fold_triple(&d.samples[offset..offset + len]))
            }
            Some(_) | None if !strict => Ok(MinMaxRms::default()),
            Some(_) => Err(StoreError::ReadPastEnd {
                offset,
                len,
                block_len: self.len,
            }),
            None => Err(StoreError::NotYetAvailable),
        }
    }

    fn read_256(&self, out: &mut [MinMaxRms], offset: usize) -> bool {
        match self.decoded.read().as_ref() {
            Some(d) => crate::block::copy_triples(&d.summary.s256, offset, out),
            None => {
                out.fill(MinMaxRms::default());
                false
            }
        }
    }

    fn read_64k(&self, out: &mut [MinMaxRms], offset: usize) -> bool {
        match self.decoded.read().as_ref() {
            Some(d) => crate::block::copy_triples(&d.summary.s64k, offset, out),
            None => {
                out.fill(MinMaxRms::default());
                false
            }
        }
    }

    fn summary_available(&self) -> bool {
        self.decoded.read().is_some()
    }

    fn data_available(&self) -> bool {
        self.decoded.read().is_some()
    }

    fn is_alias(&self) -> bool {
        true
    }

    fn storage_bytes(&self) -> u64 {
        0
    }

    fn set_length(&self, _len: usize) {}

    lock_impls!();

    fn write_xml(&self, w: &mut XmlWriter) {
        w.start_tag("oddecodeblockfile");
        w.attr_str("path", &self.path.to_string_lossy());
        w.attr_u64("offset", self.offset);
        w.attr_u64("len", self.len as u64);
        w.attr_u64("channel", self.channel as u64);
        w.attr_u64("decodetype", self.decode_type as u64);
        w.end_tag("oddecodeblockfile");
    }

    fn display_name(&self) -> String {
        format!("od-decode:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_test_wav(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample(i as f32 / frames as f32).unwrap(); // left
            writer.write_sample(-(i as f32) / frames as f32).unwrap(); // right
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_alias_reads_selected_channel() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("media.wav");
        write_test_wav(&wav, 1000);

        let left = AliasBlockFile::new(wav.clone(), 100, 50, 0).unwrap();
        let right = AliasBlockFile::new(wav, 100, 50, 1).unwrap();

        let mut l = vec![0.0; 50];
        let mut r = vec![0.0; 50];
        left.read(&mut l, 0, true).unwrap();
        right.read(&mut r, 0, true).unwrap();
        assert!((l[0] - 0.1).abs() < 1e-6);
        assert!((r[0] + 0.1).abs() < 1e-6);
        assert_eq!(left.storage_bytes(), 0);
        assert!(left.is_alias());
    }

    #[test]
    fn test_alias_summary_computed_eagerly() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("media.wav");
        write_test_wav(&wav, 512);

        let block = AliasBlockFile::new(wav, 0, 512, 0).unwrap();
        assert!(block.summary_available());
        let mmr = block.min_max_rms();
        assert_eq!(mmr.min, 0.0);
        assert!(mmr.max > 0.99);
    }

    #[test]
    fn test_od_alias_summary_deferred() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("media.wav");
        write_test_wav(&wav, 512);

        let block = OnDemandAliasBlockFile::new(wav, 0, 512, 0);
        assert!(!block.summary_available());
        let mut s = vec![MinMaxRms { min: 1.0, max: 1.0, rms: 1.0 }; 2];
        assert!(!block.read_256(&mut s, 0));
        assert_eq!(s[0], MinMaxRms::default());

        block.compute_summary().unwrap();
        assert!(block.summary_available());
        assert!(block.read_256(&mut s, 0));

        // Data was always readable
        let mut out = vec![0.0; 16];
        assert_eq!(block.read(&mut out, 0, true).unwrap(), 16);
    }

    #[test]
    fn test_od_decode_data_deferred() {
        let dir = tempdir().unwrap();
        let wav = dir.path().join("media.wav");
        write_test_wav(&wav, 256);

        let block = OnDemandDecodeBlockFile::new(wav, 0, 256, 0, 1);
        assert!(!block.data_available());

        let mut out = vec![1.0; 16];
        assert!(block.read(&mut out, 0, true).is_err());
        assert_eq!(block.read(&mut out, 0, false).unwrap(), 0);
        assert!(out.iter().all(|&v| v == 0.0));

        block.decode().unwrap();
        assert!(block.data_available());
        assert_eq!(block.read(&mut out, 64, true).unwrap(), 16);
        assert!((out[0] - 0.25).abs() < 1e-6);
    }
}
