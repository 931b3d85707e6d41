//! Simple block files
//!
//! One project-local `.sb` file per block: a little-endian header, the
//! whole-block min/max/rms, the 64K and 256-stride summary triples, then the
//! samples encoded in the sequence's storage format. Files are written once
//! and never modified; the last handle to drop removes the file unless it
//! was locked for a saved project.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use strata_core::{decode_samples, encode_samples, Sample, SampleFormat, XmlWriter};

use crate::block::{copy_triples, fold_triple};
use crate::{BlockFile, MinMaxRms, StoreError, StoreResult, SummaryData};

const MAGIC: &[u8; 4] = b"STSB";
const VERSION: u16 = 1;
const TRIPLE_BYTES: usize = 12;
const HEADER_BYTES: usize = 4 + 2 + 2 + 8 + 4 + 4 + TRIPLE_BYTES;

#[derive(Debug)]
pub struct SimpleBlockFile {
    path: PathBuf,
    format: SampleFormat,
    len: AtomicUsize,
    summary: SummaryData,
    map: Mmap,
    data_off: usize,
    locked: AtomicBool,
}

impl SimpleBlockFile {
    /// Write a new block file holding `samples` and return a handle to it
    pub fn create(
        path: PathBuf,
        samples: &[Sample],
        format: SampleFormat,
    ) -> StoreResult<Arc<Self>> {
        let summary = SummaryData::compute(samples);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&format.code().to_le_bytes())?;
        w.write_all(&(samples.len() as u64).to_le_bytes())?;
        w.write_all(&(summary.s64k.len() as u32).to_le_bytes())?;
        w.write_all(&(summary.s256.len() as u32).to_le_bytes())?;
        write_triple(&mut w, summary.all)?;
        for &t in &summary.s64k {
            write_triple(&mut w, t)?;
        }
        for &t in &summary.s256 {
            write_triple(&mut w, t)?;
        }

        let mut data = Vec::new();
        encode_samples(samples, format, &mut data);
        w.write_all(&data)?;
        w.flush()?;
        drop(w);

        // Reopen read-only so reads go through the same mapped path as
        // blocks loaded from an existing project
        Self::open(path)
    }

    /// Open an existing block file, parsing and validating its header
    pub fn open(path: PathBuf) -> StoreResult<Arc<Self>> {
        let file = File::open(&path)?;
        // Safety: block files are written once and never modified in place
        let map = unsafe { Mmap::map(&file)? };

        let bad = |msg: &str| StoreError::InvalidBlockFile(format!("{}: {}", path.display(), msg));

        if map.len() < HEADER_BYTES || &map[0..4] != MAGIC {
            return Err(bad("bad magic"));
        }
        if read_u16(&map, 4) != VERSION {
            return Err(bad("unsupported version"));
        }
        let format = SampleFormat::from_code(read_u16(&map, 6) as i64)
            .ok_or_else(|| bad("unknown sample format"))?;
        let len = read_u64(&map, 8) as usize;
        let n64k = read_u32(&map, 16) as usize;
        let n256 = read_u32(&map, 20) as usize;

        let summaries_off = HEADER_BYTES;
        let data_off = summaries_off + (n64k + n256) * TRIPLE_BYTES;
        if map.len() < data_off + len * format.bytes() {
            return Err(bad("truncated"));
        }

        let all = read_triple(&map, 24);
        let s64k = (0..n64k)
            .map(|i| read_triple(&map, summaries_off + i * TRIPLE_BYTES))
            .collect();
        let s256 = (0..n256)
            .map(|i| read_triple(&map, summaries_off + (n64k + i) * TRIPLE_BYTES))
            .collect();

        Ok(Arc::new(Self {
            path,
            format,
            len: AtomicUsize::new(len),
            summary: SummaryData { all, s256, s64k },
            map,
            data_off,
            locked: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }
}

impl BlockFile for SimpleBlockFile {
    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn read(&self, out: &mut [Sample], offset: usize, strict: bool) -> StoreResult<usize> {
        let len = self.len();
        if offset + out.len() > len {
            if strict {
                return Err(StoreError::ReadPastEnd {
                    offset,
                    len: out.len(),
                    block_len: len,
                });
            }
            let avail = len.saturating_sub(offset);
            let (head, tail) = out.split_at_mut(avail);
            tail.fill(0.0);
            if avail == 0 {
                return Ok(0);
            }
            self.decode_into(head, offset);
            return Ok(avail);
        }
        self.decode_into(out, offset);
        Ok(out.len())
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
        copy_triples(&self.summary.s256, offset, out)
    }

    fn read_64k(&self, out: &mut [MinMaxRms], offset: usize) -> bool {
        copy_triples(&self.summary.s64k, offset, out)
    }

    fn storage_bytes(&self) -> u64 {
        self.map.len() as u64
    }

    fn storage_format(&self) -> Option<SampleFormat> {
        Some(self.format)
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
        w.start_tag("simpleblockfile");
        if let Some(name) = self.path.file_name().and_then(|n| n.to_str()) {
            w.attr_str("filename", name);
        }
        w.attr_u64("len", self.len() as u64);
        w.end_tag("simpleblockfile");
    }

    fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl SimpleBlockFile {
    fn decode_into(&self, out: &mut [Sample], offset: usize) {
        let bytes = self.format.bytes();
        let start = self.data_off + offset * bytes;
        decode_samples(&self.map[start..start + out.len() * bytes], self.format, out);
    }
}

impl Drop for SimpleBlockFile {
    fn drop(&mut self) {
        // Unlocked block files are project-private scratch; reclaim them
        if !self.is_locked() {
            std::fs::remove_file(&self.path).ok();
        }
    }
}

fn write_triple<W: Write>(w: &mut W, t: MinMaxRms) -> std::io::Result<()> {
    w.write_all(&t.min.to_le_bytes())?;
    w.write_all(&t.max.to_le_bytes())?;
    w.write_all(&t.rms.to_le_bytes())
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn read_f32(buf: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_triple(buf: &[u8], off: usize) -> MinMaxRms {
    MinMaxRms {
        min: read_f32(buf, off),
        max: read_f32(buf, off + 4),
        rms: read_f32(buf, off + 8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ramp(n: usize) -> Vec<Sample> {
        (0..n).map(|i| i as f32 / n as f32).collect()
    }

    #[test]
    fn test_create_and_read_back() {
        let dir = tempdir().unwrap();
        let samples = ramp(500);
        let block =
            SimpleBlockFile::create(dir.path().join("b0.sb"), &samples, SampleFormat::Float)
                .unwrap();

        assert_eq!(block.len(), 500);
        let mut out = vec![0.0; 500];
        block.read(&mut out, 0, true).unwrap();
        assert_eq!(out, samples);

        // Partial read
        let mut part = vec![0.0; 10];
        block.read(&mut part, 100, true).unwrap();
        assert_eq!(part, &samples[100..110]);
    }

    #[test]
    fn test_reopen_preserves_summary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b1.sb");
        let samples = ramp(1000);
        let created =
            SimpleBlockFile::create(path.clone(), &samples, SampleFormat::Float).unwrap();
        created.lock(); // keep the file past drop
        let expected = created.min_max_rms();
        drop(created);

        let reopened = SimpleBlockFile::open(path).unwrap();
        assert_eq!(reopened.len(), 1000);
        assert_eq!(reopened.min_max_rms(), expected);
        let mut s = vec![MinMaxRms::default(); 2];
        assert!(reopened.read_256(&mut s, 0));
        assert_eq!(s[0].min, 0.0);
    }

    #[test]
    fn test_strict_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let block =
            SimpleBlockFile::create(dir.path().join("b2.sb"), &ramp(64), SampleFormat::Float)
                .unwrap();
        let mut out = vec![0.0; 65];
        assert!(block.read(&mut out, 0, true).is_err());

        // Lenient read zero-fills the tail
        let n = block.read(&mut out, 0, false).unwrap();
        assert_eq!(n, 64);
        assert_eq!(out[64], 0.0);
    }

    #[test]
    fn test_int16_storage_quantizes() {
        let dir = tempdir().unwrap();
        let samples = vec![0.1234567f32; 16];
        let block =
            SimpleBlockFile::create(dir.path().join("b3.sb"), &samples, SampleFormat::Int16)
                .unwrap();
        let mut out = vec![0.0; 16];
        block.read(&mut out, 0, true).unwrap();
        assert_ne!(out[0], samples[0]);
        assert!((out[0] - samples[0]).abs() < 1.0 / 32767.0 + 1e-6);
    }

    #[test]
    fn test_unlocked_drop_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b4.sb");
        let block =
            SimpleBlockFile::create(path.clone(), &ramp(8), SampleFormat::Float).unwrap();
        assert!(path.exists());
        drop(block);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.sb");
        std::fs::write(&path, b"not a block file at all").unwrap();
        assert!(SimpleBlockFile::open(path).is_err());
    }
}
