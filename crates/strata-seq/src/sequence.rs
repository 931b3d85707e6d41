//! The sequence: a flat-array view over an ordered list of block files
//!
//! Every mutator follows one of two shapes:
//!
//! - **In-place handle swap**: exactly one existing block's file changes and
//!   no other starts move until the new file exists. Building the file may
//!   fail; the swap and start adjustments cannot.
//! - **Rebuild**: a candidate block list is assembled on the side, every
//!   allocation and file creation targeting it, then
//!   [`Sequence::commit_if_consistent`] checks it and swaps it in with a
//!   plain non-failing assignment.
//!
//! Either way a failed edit leaves the sequence exactly as it was.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use strata_core::{
    limit_buffer_size, max_block_samples, overflows, Sample, SampleCount, SampleFormat,
};
use strata_store::{BlockHandle, BlockStore};

use crate::{blockify, find_block, inconsistency, BlockRef, SeqResult};

pub struct Sequence {
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) blocks: Vec<BlockRef>,
    pub(crate) num_samples: SampleCount,
    pub(crate) format: SampleFormat,
    pub(crate) min_samples: usize,
    pub(crate) max_samples: usize,
    pub(crate) error_opening: bool,
    /// Serialises Delete against background decode tasks iterating the
    /// block list; see [`Sequence::decode_barrier`]
    pub(crate) od_mutex: Arc<Mutex<()>>,
}

impl Sequence {
    /// Create an empty sequence whose block length bounds derive from the
    /// process-wide disk block size
    pub fn new(store: Arc<dyn BlockStore>, format: SampleFormat) -> Self {
        let max_samples = max_block_samples(format);
        Self::with_max_samples(store, format, max_samples)
    }

    /// Create an empty sequence with an explicit upper block length bound.
    /// For callers that need deterministic block granularity; the target
    /// minimum is half the maximum, as always.
    pub fn with_max_samples(
        store: Arc<dyn BlockStore>,
        format: SampleFormat,
        max_samples: usize,
    ) -> Self {
        Self {
            store,
            blocks: Vec::new(),
            num_samples: 0,
            format,
            min_samples: max_samples / 2,
            max_samples,
            error_opening: false,
            od_mutex: Arc::new(Mutex::new(())),
        }
    }

    /// Logically deep, physically shallow copy: all blocks shared by
    /// reference count
    pub fn duplicate(&self) -> SeqResult<Self> {
        let mut dest = Self::with_max_samples(self.store.clone(), self.format, self.max_samples);
        dest.paste(0, self)?;
        Ok(dest)
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn num_samples(&self) -> SampleCount {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[BlockRef] {
        &self.blocks
    }

    pub fn max_block_size(&self) -> usize {
        self.max_samples
    }

    pub fn min_block_size(&self) -> usize {
        self.min_samples
    }

    /// Preferred length for newly created blocks
    pub fn ideal_block_size(&self) -> usize {
        self.max_samples
    }

    /// True when loading had to repair gaps; see [`Sequence::read_xml`]
    pub fn error_opening(&self) -> bool {
        self.error_opening
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// The mutex background decode tasks must hold while iterating this
    /// sequence's blocks. `delete` holds it through its commit.
    pub fn decode_barrier(&self) -> Arc<Mutex<()>> {
        self.od_mutex.clone()
    }

    /// True when some block still lacks data or summaries and a background
    /// task should run
    pub fn needs_background_work(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| !b.file.data_available() || !b.file.summary_available())
    }

    /// Start position of the block containing `pos`
    pub fn block_start(&self, pos: SampleCount) -> Option<SampleCount> {
        if pos < 0 || pos >= self.num_samples {
            return None;
        }
        Some(self.blocks[find_block(&self.blocks, pos)].start)
    }

    /// A good number of samples to grab in one chunk starting at `start` so
    /// that reads land on block boundaries: the remainder of the containing
    /// block, extended over following whole blocks while the accumulation is
    /// still under the minimum and the extension stays within the maximum.
    pub fn best_block_size(&self, start: SampleCount) -> usize {
        if start < 0 || start >= self.num_samples {
            return self.max_samples;
        }

        let mut b = find_block(&self.blocks, start);
        let num_blocks = self.blocks.len();
        let mut result = (self.blocks[b].end() - start) as usize;

        while result < self.min_samples && b + 1 < num_blocks {
            let length = self.blocks[b + 1].len();
            if result + length > self.max_samples {
                break;
            }
            b += 1;
            result += length;
        }

        debug_assert!(result > 0 && result <= self.max_samples);
        result
    }

    /// How many samples the next `append` can take before it stops filling
    /// the current tail block
    pub fn ideal_append_len(&self) -> usize {
        let max = self.max_samples;
        match self.blocks.last() {
            None => max,
            Some(last) if last.len() >= max => max,
            Some(last) => max - last.len(),
        }
    }

    // -----------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------

    /// Read `len` samples starting at `start`, strictly
    pub fn get(&self, start: SampleCount, len: usize) -> SeqResult<Vec<Sample>> {
        let mut buf = vec![0.0; len];
        self.get_into(&mut buf, start, true)?;
        Ok(buf)
    }

    /// Fill `out` with samples starting at `start`.
    ///
    /// With `strict`, range violations and read failures are errors. Without
    /// it, failures zero-fill and report `Ok(false)`; display paths rely on
    /// this never failing.
    pub fn get_into(
        &self,
        out: &mut [Sample],
        start: SampleCount,
        strict: bool,
    ) -> SeqResult<bool> {
        if start == self.num_samples {
            if out.is_empty() {
                return Ok(true);
            }
            if strict {
                return Err(inconsistency("get"));
            }
            out.fill(0.0);
            return Ok(false);
        }

        if start < 0
            || start > self.num_samples
            || start + out.len() as SampleCount > self.num_samples
        {
            if strict {
                return Err(inconsistency("get"));
            }
            out.fill(0.0);
            return Ok(false);
        }

        if out.is_empty() {
            return Ok(true);
        }

        let b = find_block(&self.blocks, start);
        self.get_from_block(b, out, start, strict)
    }

    /// Multi-block read starting inside block `b`
    fn get_from_block(
        &self,
        mut b: usize,
        out: &mut [Sample],
        mut start: SampleCount,
        strict: bool,
    ) -> SeqResult<bool> {
        let mut ok = true;
        let mut filled = 0usize;
        while filled < out.len() {
            let block = &self.blocks[b];
            let bstart = (start - block.start) as usize;
            let blen = (out.len() - filled).min(block.len() - bstart);

            if !read_block(&mut out[filled..filled + blen], block, bstart, strict)? {
                ok = false;
            }

            filled += blen;
            start += blen as SampleCount;
            b += 1;
        }
        Ok(ok)
    }

    /// Min and max over `[start, start + len)`.
    ///
    /// Interior blocks come from cached whole-block summaries; the partially
    /// covered edge blocks are only scanned when their whole-block extremes
    /// could change the answer. An empty range reports `(0.0, 0.0)` — not
    /// distinguishable from genuine silence, kept for compatibility.
    pub fn get_min_max(
        &self,
        start: SampleCount,
        len: SampleCount,
        strict: bool,
    ) -> SeqResult<(f32, f32)> {
        if len == 0 || self.blocks.is_empty() {
            return Ok((0.0, 0.0));
        }
        if start < 0 || len < 0 || start + len > self.num_samples {
            if strict {
                return Err(inconsistency("get_min_max"));
            }
            return Ok((0.0, 0.0));
        }

        let mut min = f32::MAX;
        let mut max = -f32::MAX;

        let block0 = find_block(&self.blocks, start);
        let block1 = find_block(&self.blocks, start + len - 1);

        for b in block0 + 1..block1 {
            let r = self.blocks[b].file.min_max_rms();
            min = min.min(r.min);
            max = max.max(r.max);
        }

        {
            let block = &self.blocks[block0];
            let whole = block.file.min_max_rms();
            if whole.min < min || whole.max > max {
                let s0 = (start - block.start) as usize;
                let max_l0 = (block.end() - start) as usize;
                let l0 = limit_buffer_size(max_l0, len);
                let r = block.file.min_max_rms_range(s0, l0, strict)?;
                min = min.min(r.min);
                max = max.max(r.max);
            }
        }

        if block1 > block0 {
            let block = &self.blocks[block1];
            let whole = block.file.min_max_rms();
            if whole.min < min || whole.max > max {
                let l0 = (start + len - block.start) as usize;
                let r = block.file.min_max_rms_range(0, l0, strict)?;
                min = min.min(r.min);
                max = max.max(r.max);
            }
        }

        Ok((min, max))
    }

    /// RMS over `[start, start + len)`, folding cached per-block RMS for
    /// interior blocks. An empty range reports 0.
    pub fn get_rms(&self, start: SampleCount, len: SampleCount, strict: bool) -> SeqResult<f32> {
        if len == 0 || self.blocks.is_empty() {
            return Ok(0.0);
        }
        if start < 0 || len < 0 || start + len > self.num_samples {
            if strict {
                return Err(inconsistency("get_rms"));
            }
            return Ok(0.0);
        }

        let mut sumsq = 0.0f64;
        let mut length: SampleCount = 0;

        let block0 = find_block(&self.blocks, start);
        let block1 = find_block(&self.blocks, start + len - 1);

        for b in block0 + 1..block1 {
            let block = &self.blocks[b];
            let rms = block.file.min_max_rms().rms as f64;
            sumsq += rms * rms * block.len() as f64;
            length += block.len() as SampleCount;
        }

        {
            let block = &self.blocks[block0];
            let s0 = (start - block.start) as usize;
            let max_l0 = (block.end() - start) as usize;
            let l0 = limit_buffer_size(max_l0, len);
            let r = block.file.min_max_rms_range(s0, l0, strict)?;
            sumsq += r.rms as f64 * r.rms as f64 * l0 as f64;
            length += l0 as SampleCount;
        }

        if block1 > block0 {
            let block = &self.blocks[block1];
            let l0 = (start + len - block.start) as usize;
            let r = block.file.min_max_rms_range(0, l0, strict)?;
            sumsq += r.rms as f64 * r.rms as f64 * l0 as f64;
            length += l0 as SampleCount;
        }

        debug_assert_eq!(length, len);
        Ok((sumsq / length as f64).sqrt() as f32)
    }

    /// Copy `[s0, s1)` into a new sequence. Interior blocks are shared by
    /// reference; only the partially covered edges are re-blocked.
    pub fn copy(&self, s0: SampleCount, s1: SampleCount) -> SeqResult<Sequence> {
        let mut dest = Self::with_max_samples(self.store.clone(), self.format, self.max_samples);
        if s0 >= s1 || s0 >= self.num_samples || s1 < 0 {
            return Ok(dest);
        }
        let s1 = s1.min(self.num_samples);

        let b0 = find_block(&self.blocks, s0);
        let b1 = find_block(&self.blocks, s1 - 1);

        let block0 = &self.blocks[b0];
        let copied_first = s0 != block0.start;
        if copied_first {
            let block_len = (s1.min(block0.end()) - s0) as usize;
            let mut buffer = vec![0.0; block_len];
            self.get_from_block(b0, &mut buffer, s0, true)?;
            dest.append(&buffer)?;
        }

        // Fully covered interior blocks transfer by reference count
        let mid_start = if copied_first { b0 + 1 } else { b0 };
        for bb in mid_start..b1 {
            append_shared_block(
                self.store.as_ref(),
                &mut dest.blocks,
                &mut dest.num_samples,
                &self.blocks[bb],
            )?;
        }

        if b1 > b0 || !copied_first {
            let block = &self.blocks[b1];
            let block_len = (s1 - block.start) as usize;
            if block_len < block.len() {
                let mut buffer = vec![0.0; block_len];
                self.get_from_block(b1, &mut buffer, block.start, true)?;
                dest.append(&buffer)?;
            } else {
                append_shared_block(
                    self.store.as_ref(),
                    &mut dest.blocks,
                    &mut dest.num_samples,
                    block,
                )?;
            }
        }

        dest.check_consistency()?;
        Ok(dest)
    }

    // -----------------------------------------------------------------
    // Editing
    // -----------------------------------------------------------------

    /// Insert all of `src` at position `s`
    pub fn paste(&mut self, s: SampleCount, src: &Sequence) -> SeqResult<()> {
        if s < 0 || s > self.num_samples {
            log::error!(
                "paste: position {} outside sequence of {} samples",
                s,
                self.num_samples
            );
            return Err(inconsistency("paste"));
        }
        if overflows(self.num_samples, src.num_samples) {
            log::error!(
                "paste: {} + {} samples would overflow",
                self.num_samples,
                src.num_samples
            );
            return Err(inconsistency("paste"));
        }
        if src.format != self.format {
            log::error!(
                "paste: source format {} does not match destination format {}",
                src.format.name(),
                self.format.name()
            );
            return Err(inconsistency("paste"));
        }

        let added_len = src.num_samples;
        let src_num_blocks = src.blocks.len();
        if added_len == 0 || src_num_blocks == 0 {
            return Ok(());
        }

        let num_blocks = self.blocks.len();

        if num_blocks == 0
            || (s == self.num_samples
                && self.blocks[num_blocks - 1].len() >= self.min_samples)
        {
            // Appending after a well-formed tail: share every source block.
            // Built as a copy so a failed share leaves the original alone.
            let mut new_blocks = self.blocks.clone();
            let mut total = self.num_samples;
            for src_block in &src.blocks {
                append_shared_block(self.store.as_ref(), &mut new_blocks, &mut total, src_block)?;
            }
            return self.commit_if_consistent(new_blocks, total, "paste: append");
        }

        let b = if s == self.num_samples {
            num_blocks - 1
        } else {
            find_block(&self.blocks, s)
        };
        let length = self.blocks[b].len();
        let larger_block_len = added_len + length as SampleCount;

        if larger_block_len <= self.max_samples as SampleCount {
            // Everything fits in the one split block: build its replacement
            // file, then swap the handle and shift later starts, neither of
            // which can fail.
            let s_added_len = added_len as usize;
            let mut buffer = vec![0.0; larger_block_len as usize];
            {
                let block = &self.blocks[b];
                let split_point = (s - block.start) as usize;
                read_block(&mut buffer[..split_point], block, 0, true)?;
                src.get_into(
                    &mut buffer[split_point..split_point + s_added_len],
                    0,
                    true,
                )?;
                read_block(
                    &mut buffer[split_point + s_added_len..],
                    block,
                    split_point,
                    true,
                )?;
            }

            let file = self.store.new_simple_block(&buffer, self.format)?;

            self.blocks[b].file = file;
            for block in &mut self.blocks[b + 1..] {
                block.start += added_len;
            }
            self.num_samples += added_len;

            self.soft_consistency_check("paste: single block");
            return Ok(());
        }

        let mut new_blocks = Vec::with_capacity(num_blocks + src_num_blocks + 2);
        new_blocks.extend_from_slice(&self.blocks[..b]);

        let split_start = self.blocks[b].start;
        let split_len = length;
        let split_point = (s - split_start) as usize;

        if src_num_blocks <= 4 {
            // Small source: lump split block and all of src into one buffer
            // and re-split it
            let s_added_len = added_len as usize;
            let sum = split_len + s_added_len;

            let mut buffer = vec![0.0; sum];
            {
                let split_block = &self.blocks[b];
                read_block(&mut buffer[..split_point], split_block, 0, true)?;
                src.get_into(
                    &mut buffer[split_point..split_point + s_added_len],
                    0,
                    true,
                )?;
                read_block(
                    &mut buffer[split_point + s_added_len..],
                    split_block,
                    split_point,
                    true,
                )?;
            }

            blockify(
                self.store.as_ref(),
                self.max_samples,
                self.format,
                &mut new_blocks,
                split_start,
                &buffer,
            )?;
        } else {
            // Large source: merge the first two source blocks with the left
            // half of the split block and the last two with its right half,
            // sharing everything in between untouched. Only four boundary
            // blocks ever get rewritten, and no run of undersized blocks can
            // accumulate at the seams.
            let src_first_two = src.blocks[0].len() + src.blocks[1].len();
            let left_len = split_point + src_first_two;

            let penultimate_start = src.blocks[src_num_blocks - 2].start;
            let src_last_two =
                src.blocks[src_num_blocks - 2].len() + src.blocks[src_num_blocks - 1].len();
            let right_split = split_len - split_point;
            let right_len = right_split + src_last_two;

            let mut buffer = vec![0.0; left_len.max(right_len)];
            {
                let split_block = &self.blocks[b];
                read_block(&mut buffer[..split_point], split_block, 0, true)?;
                src.get_into(&mut buffer[split_point..left_len], 0, true)?;
            }
            blockify(
                self.store.as_ref(),
                self.max_samples,
                self.format,
                &mut new_blocks,
                split_start,
                &buffer[..left_len],
            )?;

            for src_block in &src.blocks[2..src_num_blocks - 2] {
                let file = self.store.copy_block(&src_block.file)?;
                new_blocks.push(BlockRef::new(file, src_block.start + s));
            }

            src.get_into(&mut buffer[..src_last_two], penultimate_start, true)?;
            {
                let split_block = &self.blocks[b];
                read_block(
                    &mut buffer[src_last_two..right_len],
                    split_block,
                    split_point,
                    true,
                )?;
            }
            blockify(
                self.store.as_ref(),
                self.max_samples,
                self.format,
                &mut new_blocks,
                s + penultimate_start,
                &buffer[..right_len],
            )?;
        }

        for block in &self.blocks[b + 1..] {
            new_blocks.push(block.shifted(added_len));
        }

        let new_total = self.num_samples + added_len;
        self.commit_if_consistent(new_blocks, new_total, "paste: rebuild")
    }

    /// Remove `[start, start + len)`
    pub fn delete(&mut self, start: SampleCount, len: SampleCount) -> SeqResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = match (len >= 0).then(|| start.checked_add(len)).flatten() {
            Some(end) if start >= 0 && end <= self.num_samples => end,
            _ => return Err(inconsistency("delete")),
        };

        // Background decode tasks walk the block list; deletion must not
        // pull blocks out from under them
        let od_mutex = self.od_mutex.clone();
        let _barrier = od_mutex.lock();

        let num_blocks = self.blocks.len();
        let b0 = find_block(&self.blocks, start);
        let mut b1 = find_block(&self.blocks, end - 1);

        // All inside one block, and what remains is big enough to stand
        // alone: replace just that block's file
        let length = self.blocks[b0].len();
        if b0 == b1 && length as SampleCount - len >= self.min_samples as SampleCount {
            let pos = (start - self.blocks[b0].start) as usize;
            debug_assert!((len as usize) < length);
            let new_len = length - len as usize;

            let mut buffer = vec![0.0; new_len];
            {
                let block = &self.blocks[b0];
                read_block(&mut buffer[..pos], block, 0, true)?;
                read_block(&mut buffer[pos..], block, pos + len as usize, true)?;
            }

            let file = self.store.new_simple_block(&buffer, self.format)?;

            self.blocks[b0].file = file;
            for block in &mut self.blocks[b0 + 1..] {
                block.start -= len;
            }
            self.num_samples -= len;

            self.soft_consistency_check("delete: single block");
            return Ok(());
        }

        let mut new_blocks = Vec::with_capacity(num_blocks - (b1 - b0) + 2);
        new_blocks.extend_from_slice(&self.blocks[..b0]);

        // Keep the samples of the first affected block before the deletion
        // point. Big enough (or first in the list): its own block. Too
        // small: merge with the preceding block and re-split the union.
        let pre_block = &self.blocks[b0];
        let pre_buffer_len = (start - pre_block.start) as usize;
        if pre_buffer_len > 0 {
            if pre_buffer_len >= self.min_samples || b0 == 0 {
                let mut buffer = vec![0.0; pre_buffer_len];
                read_block(&mut buffer, pre_block, 0, true)?;
                let file = self.store.new_simple_block(&buffer, self.format)?;
                new_blocks.push(BlockRef::new(file, pre_block.start));
            } else {
                let prev_block = &self.blocks[b0 - 1];
                let prev_len = prev_block.len();
                let sum = prev_len + pre_buffer_len;

                let mut buffer = vec![0.0; sum];
                read_block(&mut buffer[..prev_len], prev_block, 0, true)?;
                read_block(&mut buffer[prev_len..], pre_block, 0, true)?;

                new_blocks.pop();
                blockify(
                    self.store.as_ref(),
                    self.max_samples,
                    self.format,
                    &mut new_blocks,
                    prev_block.start,
                    &buffer,
                )?;
            }
        }

        // Symmetrically for the samples of the last affected block after
        // the deletion point, possibly merging with the following block
        let post_block = &self.blocks[b1];
        let post_buffer_len = (post_block.end() - end) as usize;
        if post_buffer_len > 0 {
            let pos = (end - post_block.start) as usize;
            if post_buffer_len >= self.min_samples || b1 == num_blocks - 1 {
                let mut buffer = vec![0.0; post_buffer_len];
                read_block(&mut buffer, post_block, pos, true)?;
                let file = self.store.new_simple_block(&buffer, self.format)?;
                new_blocks.push(BlockRef::new(file, start));
            } else {
                let next_block = &self.blocks[b1 + 1];
                let next_len = next_block.len();
                let sum = next_len + post_buffer_len;

                let mut buffer = vec![0.0; sum];
                read_block(&mut buffer[..post_buffer_len], post_block, pos, true)?;
                read_block(&mut buffer[post_buffer_len..], next_block, 0, true)?;

                blockify(
                    self.store.as_ref(),
                    self.max_samples,
                    self.format,
                    &mut new_blocks,
                    start,
                    &buffer,
                )?;
                b1 += 1;
            }
        }

        for block in &self.blocks[b1 + 1..] {
            new_blocks.push(block.shifted(-len));
        }

        let new_total = self.num_samples - len;
        self.commit_if_consistent(new_blocks, new_total, "delete: rebuild")
    }

    /// Overwrite `[start, start + len)` with `buffer`, or with silence when
    /// `buffer` is `None`. Fully covered blocks become fresh simple blocks
    /// (silent blocks for silence); partially covered blocks are read whole,
    /// patched, and rewritten.
    pub fn set_samples(
        &mut self,
        buffer: Option<&[Sample]>,
        start: SampleCount,
        len: SampleCount,
    ) -> SeqResult<()> {
        if len < 0 || start < 0 || start >= self.num_samples || start + len > self.num_samples {
            return Err(inconsistency("set_samples"));
        }
        if let Some(buf) = buffer {
            if buf.len() as SampleCount != len {
                return Err(inconsistency("set_samples"));
            }
        }

        let mut b = find_block(&self.blocks, start);
        let mut new_blocks = Vec::with_capacity(self.blocks.len());
        new_blocks.extend_from_slice(&self.blocks[..b]);

        let mut remaining = len;
        let mut pos = start;
        let mut buf_pos = 0usize;
        let mut scratch = Vec::new();

        while remaining != 0 {
            let block = self.blocks[b].clone();
            let bstart = (pos - block.start) as usize;
            let file_length = block.len();
            let blen = limit_buffer_size(file_length - bstart, remaining);

            if file_length > self.max_samples || bstart + blen > file_length {
                return Err(inconsistency("set_samples"));
            }

            let file = if bstart > 0 || blen < file_length {
                // Partial overwrite: patch a full copy of the block
                scratch.resize(file_length, 0.0);
                read_block(&mut scratch[..file_length], &block, 0, true)?;
                match buffer {
                    Some(buf) => {
                        scratch[bstart..bstart + blen]
                            .copy_from_slice(&buf[buf_pos..buf_pos + blen]);
                    }
                    None => scratch[bstart..bstart + blen].fill(0.0),
                }
                self.store
                    .new_simple_block(&scratch[..file_length], self.format)?
            } else {
                // Total replacement: skip reading the old contents
                match buffer {
                    Some(buf) => self
                        .store
                        .new_simple_block(&buf[buf_pos..buf_pos + blen], self.format)?,
                    None => self.store.new_silent_block(file_length),
                }
            };
            new_blocks.push(BlockRef::new(file, block.start));

            buf_pos += blen;
            remaining -= blen as SampleCount;
            pos += blen as SampleCount;
            b += 1;
        }

        new_blocks.extend_from_slice(&self.blocks[b..]);
        let total = self.num_samples;
        self.commit_if_consistent(new_blocks, total, "set_samples")
    }

    /// Overwrite a range with silence
    pub fn set_silence(&mut self, start: SampleCount, len: SampleCount) -> SeqResult<()> {
        self.set_samples(None, start, len)
    }

    /// Insert `len` silent samples at `s`. Builds a temporary sequence of
    /// silent blocks and pastes it, so no sample data is written: disk cost
    /// is zero regardless of `len`.
    pub fn insert_silence(&mut self, s: SampleCount, len: SampleCount) -> SeqResult<()> {
        if overflows(self.num_samples, len) {
            return Err(inconsistency("insert_silence"));
        }
        if len <= 0 {
            return Ok(());
        }

        let mut silence =
            Self::with_max_samples(self.store.clone(), self.format, self.max_samples);
        let ideal = self.ideal_block_size() as SampleCount;

        let mut pos: SampleCount = 0;
        let mut remaining = len;

        if remaining >= ideal {
            // One silent file shared by every full-size piece
            let silent = self.store.new_silent_block(ideal as usize);
            while remaining >= ideal {
                silence.blocks.push(BlockRef::new(silent.clone(), pos));
                pos += ideal;
                remaining -= ideal;
            }
        }
        if remaining != 0 {
            silence.blocks.push(BlockRef::new(
                self.store.new_silent_block(remaining as usize),
                pos,
            ));
            pos += remaining;
        }
        silence.num_samples = pos;

        self.paste(s, &silence)
    }

    /// Append samples, optimised for repeated streaming calls: an undersized
    /// tail block is enlarged first, then the rest is cut into ideal-size
    /// blocks, and only the appended suffix is consistency checked.
    pub fn append(&mut self, buffer: &[Sample]) -> SeqResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        if overflows(self.num_samples, buffer.len() as SampleCount) {
            return Err(inconsistency("append"));
        }

        let mut new_blocks = Vec::new();
        let mut new_total = self.num_samples;
        let mut pos = 0usize;
        let mut replace_last = false;

        if let Some(last) = self.blocks.last() {
            let length = last.len();
            if length < self.min_samples {
                let add_len = (self.max_samples - length).min(buffer.len());

                let mut merged = vec![0.0; length + add_len];
                read_block(&mut merged[..length], last, 0, true)?;
                merged[length..].copy_from_slice(&buffer[..add_len]);

                let file = self.store.new_simple_block(&merged, self.format)?;
                new_blocks.push(BlockRef::new(file, last.start));

                pos = add_len;
                new_total += add_len as SampleCount;
                replace_last = true;
            }
        }

        while pos < buffer.len() {
            let added = self.ideal_block_size().min(buffer.len() - pos);
            let file = self
                .store
                .new_simple_block(&buffer[pos..pos + added], self.format)?;
            new_blocks.push(BlockRef::new(file, new_total));
            new_total += added as SampleCount;
            pos += added;
        }

        self.append_blocks_if_consistent(new_blocks, replace_last, new_total, "append")
    }

    /// Append one block referencing a channel of an external media file.
    /// With `use_od`, summary computation is left to a background task.
    pub fn append_alias(
        &mut self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
        use_od: bool,
    ) -> SeqResult<()> {
        if overflows(self.num_samples, len as SampleCount) {
            return Err(inconsistency("append_alias"));
        }
        let file = if use_od {
            self.store
                .new_on_demand_alias_block(path, offset, len, channel)?
        } else {
            self.store.new_alias_block(path, offset, len, channel)?
        };
        self.blocks.push(BlockRef::new(file, self.num_samples));
        self.num_samples += len as SampleCount;
        Ok(())
    }

    /// Append one block of external media that a background task must decode
    pub fn append_coded(
        &mut self,
        path: &Path,
        offset: u64,
        len: usize,
        channel: u16,
        decode_type: u16,
    ) -> SeqResult<()> {
        if overflows(self.num_samples, len as SampleCount) {
            return Err(inconsistency("append_coded"));
        }
        let file = self
            .store
            .new_on_demand_decode_block(path, offset, len, channel, decode_type)?;
        self.blocks.push(BlockRef::new(file, self.num_samples));
        self.num_samples += len as SampleCount;
        Ok(())
    }

    /// Append an already-created block without a consistency check. For bulk
    /// loaders that run one check after the whole batch.
    pub fn append_block_raw(&mut self, file: BlockHandle) -> SeqResult<()> {
        if overflows(self.num_samples, file.len() as SampleCount) {
            return Err(inconsistency("append_block_raw"));
        }
        let len = file.len();
        self.blocks.push(BlockRef::new(file, self.num_samples));
        self.num_samples += len as SampleCount;
        Ok(())
    }

    /// Re-encode every block into `new_format`, recomputing the block length
    /// bounds for the new sample size. Returns false when nothing changed.
    ///
    /// Converting to a smaller sample size grows the length bounds, and the
    /// per-block re-split can leave trailing blocks shorter than the target
    /// minimum. Accepted: only the upper bound is invariant.
    pub fn convert_to_format(&mut self, new_format: SampleFormat) -> SeqResult<bool> {
        if new_format == self.format {
            return Ok(false);
        }
        if self.blocks.is_empty() {
            self.format = new_format;
            return Ok(true);
        }

        let old_format = self.format;
        let old_min = self.min_samples;
        let old_max = self.max_samples;

        self.format = new_format;
        self.max_samples = max_block_samples(new_format);
        self.min_samples = self.max_samples / 2;

        let result = self.convert_blocks(old_max);
        if result.is_err() {
            self.format = old_format;
            self.min_samples = old_min;
            self.max_samples = old_max;
        }
        result.map(|_| true)
    }

    fn convert_blocks(&mut self, old_max: usize) -> SeqResult<()> {
        // Old-to-new length ratio gives a fair allocation guess
        let guess = 1 + self.blocks.len() * old_max / self.max_samples.max(1);
        let mut new_blocks = Vec::with_capacity(guess.max(self.blocks.len()));

        let mut buffer = Vec::new();
        for i in 0..self.blocks.len() {
            let (start, len) = {
                let block = &self.blocks[i];
                (block.start, block.len())
            };
            buffer.resize(len, 0.0);
            read_block(&mut buffer[..len], &self.blocks[i], 0, true)?;

            // New simple blocks quantize to the new format on write; the
            // re-split also handles old blocks longer than the new maximum
            blockify(
                self.store.as_ref(),
                self.max_samples,
                self.format,
                &mut new_blocks,
                start,
                &buffer[..len],
            )?;
        }

        let total = self.num_samples;
        self.commit_if_consistent(new_blocks, total, "convert_to_format")
    }

    // -----------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------

    /// Pin every block file on disk for a project save
    pub fn lock(&self) {
        for block in &self.blocks {
            block.file.lock();
        }
    }

    /// Pin every block file across project close
    pub fn close_lock(&self) {
        for block in &self.blocks {
            block.file.close_lock();
        }
    }

    pub fn unlock(&self) {
        for block in &self.blocks {
            block.file.unlock();
        }
    }

    // -----------------------------------------------------------------
    // Consistency
    // -----------------------------------------------------------------

    /// Verify the structural invariants: first start zero, contiguous
    /// starts, lengths within the maximum, total matching
    pub fn check_consistency(&self) -> SeqResult<()> {
        check_list(
            &self.blocks,
            self.max_samples,
            0,
            self.num_samples,
            "check_consistency",
        )
    }

    /// Full check of a candidate list, then the non-failing swap
    pub(crate) fn commit_if_consistent(
        &mut self,
        new_blocks: Vec<BlockRef>,
        new_total: SampleCount,
        op: &str,
    ) -> SeqResult<()> {
        check_list(&new_blocks, self.max_samples, 0, new_total, op)?;

        self.blocks = new_blocks;
        self.num_samples = new_total;
        Ok(())
    }

    /// Append `additional` (replacing the current tail block when
    /// `replace_last`), checking only the appended suffix. Repeated
    /// streaming appends would otherwise re-check the whole list every call
    /// and turn a long recording quadratic.
    pub(crate) fn append_blocks_if_consistent(
        &mut self,
        additional: Vec<BlockRef>,
        replace_last: bool,
        new_total: SampleCount,
        op: &str,
    ) -> SeqResult<()> {
        if additional.is_empty() {
            return Ok(());
        }

        let saved = if replace_last { self.blocks.pop() } else { None };
        let prev_size = self.blocks.len();

        self.blocks.extend(additional);

        match check_list(&self.blocks, self.max_samples, prev_size, new_total, op) {
            Ok(()) => {
                self.num_samples = new_total;
                Ok(())
            }
            Err(e) => {
                self.blocks.truncate(prev_size);
                if let Some(block) = saved {
                    self.blocks.push(block);
                }
                Err(e)
            }
        }
    }

    /// Post-hoc check after an in-place handle swap. Cannot throw: the swap
    /// already happened and is provably consistent; a failure here is a bug.
    fn soft_consistency_check(&self, op: &str) {
        let result = check_list(&self.blocks, self.max_samples, 0, self.num_samples, op);
        debug_assert!(result.is_ok(), "consistency lost in {}", op);
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("format", &self.format)
            .field("num_samples", &self.num_samples)
            .field("blocks", &self.blocks.len())
            .field("max_samples", &self.max_samples)
            .finish()
    }
}

/// Read one block's samples, warning on short reads
fn read_block(
    out: &mut [Sample],
    block: &BlockRef,
    offset: usize,
    strict: bool,
) -> SeqResult<bool> {
    debug_assert!(offset + out.len() <= block.len());
    let n = block.file.read(out, offset, strict)?;
    if n != out.len() {
        log::warn!(
            "expected to read {} samples from {}, got {}",
            out.len(),
            block.file.display_name(),
            n
        );
        return Ok(false);
    }
    Ok(true)
}

/// Share `src`'s file into `blocks` at the running total
fn append_shared_block(
    store: &dyn BlockStore,
    blocks: &mut Vec<BlockRef>,
    total: &mut SampleCount,
    src: &BlockRef,
) -> SeqResult<()> {
    if overflows(*total, src.len() as SampleCount) {
        return Err(inconsistency("append shared block"));
    }
    let file = store.copy_block(&src.file)?;
    let len = file.len();
    blocks.push(BlockRef::new(file, *total));
    *total += len as SampleCount;
    Ok(())
}

/// Walk `blocks[from..]` verifying contiguity, the length bound, and the
/// final total. Every commit runs this over its candidate list.
pub(crate) fn check_list(
    blocks: &[BlockRef],
    max_samples: usize,
    from: usize,
    expected_total: SampleCount,
    op: &str,
) -> SeqResult<()> {
    let mut bad = false;

    let mut pos = if from < blocks.len() {
        blocks[from].start
    } else {
        expected_total
    };
    if from == 0 && pos != 0 {
        bad = true;
    }

    if !bad {
        for block in &blocks[from..] {
            if pos != block.start || block.len() > max_samples {
                bad = true;
                break;
            }
            pos += block.len() as SampleCount;
        }
    }
    if !bad && pos != expected_total {
        bad = true;
    }

    if bad {
        log::error!("*** Consistency check failed in {}. ***", op);
        log::error!("{}", dump_blocks(blocks, expected_total));
        return Err(inconsistency(op));
    }
    Ok(())
}

/// Format the block table for consistency-failure logs
fn dump_blocks(blocks: &[BlockRef], expected_total: SampleCount) -> String {
    let mut out = String::new();
    let mut pos: SampleCount = 0;
    for (i, block) in blocks.iter().enumerate() {
        let _ = writeln!(
            out,
            "   block {:3}: start {:9}, len {:9}, {}{}",
            i,
            block.start,
            block.len(),
            block.file.display_name(),
            if pos != block.start { "   ERROR" } else { "" }
        );
        pos = block.start + block.len() as SampleCount;
    }
    if pos != expected_total {
        let _ = writeln!(out, "ERROR total {} != expected {}", pos, expected_total);
    }
    out
}
