//! Per-pixel min/max/RMS for waveform display
//!
//! The query walks the block list once, choosing per block whether to read
//! raw samples or one of the precomputed summary strides, so the cost tracks
//! the number of pixels rather than the number of samples on screen.

use strata_core::{Sample, SampleCount};
use strata_store::MinMaxRms;

use crate::{find_block, Sequence};

/// What a pixel column was computed from
enum ScanSrc<'a> {
    /// Raw samples (divisor 1)
    Samples(&'a [Sample]),
    /// Summary triples (divisor 256 or 65536)
    Triples(&'a [MinMaxRms]),
}

struct Folded {
    min: f32,
    max: f32,
    sumsq: f32,
}

fn fold(src: &ScanSrc<'_>, from: usize, count: usize) -> Folded {
    let mut min = f32::MAX;
    let mut max = -f32::MAX;
    let mut sumsq = 0.0f32;
    match src {
        ScanSrc::Samples(samples) => {
            for &v in &samples[from..from + count] {
                if v < min {
                    min = v;
                }
                if v > max {
                    max = v;
                }
                sumsq += v * v;
            }
        }
        ScanSrc::Triples(triples) => {
            for t in &triples[from..from + count] {
                if t.min < min {
                    min = t.min;
                }
                if t.max > max {
                    max = t.max;
                }
                sumsq += t.rms * t.rms;
            }
        }
    }
    Folded { min, max, sumsq }
}

impl Sequence {
    /// Fill per-pixel `min`/`max`/`rms` for the pixel columns described by
    /// `where_`: column `p` covers samples `[where_[p], where_[p + 1])`, so
    /// `where_` holds one more entry than there are pixels and must be
    /// nondecreasing.
    ///
    /// `bl[p]` reports the block the column was computed from, or
    /// `-1 - blockIndex` when that block's summary is still pending
    /// on-demand computation (the column is zeroed and the caller should
    /// redraw later).
    ///
    /// This path never fails: unreadable data shows as zeros. Returns false
    /// only when the requested window lies entirely past the end.
    pub fn get_wave_display(
        &self,
        min: &mut [f32],
        max: &mut [f32],
        rms: &mut [f32],
        bl: &mut [i64],
        where_: &[SampleCount],
    ) -> bool {
        let len = min.len();
        assert!(len > 0);
        assert_eq!(max.len(), len);
        assert_eq!(rms.len(), len);
        assert_eq!(bl.len(), len);
        assert_eq!(where_.len(), len + 1);

        let s0 = where_[0].max(0);
        if s0 >= self.num_samples {
            return false;
        }
        // When where_[len - 1] == where_[len], raise the limit so the last
        // column still gets one sample
        let s1 = self.num_samples.min((where_[len - 1] + 1).max(where_[len]));

        let mut sample_buf: Vec<Sample> = Vec::new();
        let mut triple_buf: Vec<MinMaxRms> = Vec::new();

        let mut pixel = 0usize;
        let mut src_x = s0;
        let mut next_src_x: SampleCount = 0;
        let mut last_rms_denom = 0usize;
        let mut last_divisor = 1usize;
        let mut where_now = (s1 - 1).min(where_[0]);
        let mut where_next: SampleCount = 0;

        let n_blocks = self.blocks.len();
        let block0 = find_block(&self.blocks, s0);

        for b in block0..n_blocks {
            if b > block0 {
                src_x = next_src_x;
            }
            if src_x >= s1 {
                break;
            }

            let seq_block = &self.blocks[b];
            let start = seq_block.start;
            next_src_x = s1.min(start + seq_block.len() as SampleCount);

            // Pixel columns whose starting sample this block covers
            let mut next_pixel;
            if next_src_x >= s1 {
                // last pass
                next_pixel = len;
            } else {
                next_pixel = pixel;
                // Taking min with s1 - 1 here and below keeps the last
                // column from starving when where_ runs past the end
                while next_pixel < len {
                    where_next = (s1 - 1).min(where_[next_pixel]);
                    if where_next >= next_src_x {
                        break;
                    }
                    next_pixel += 1;
                }
            }
            if next_pixel == pixel {
                // The entire block falls within one pixel column: omit its
                // contents. Not exact, but at zoom levels where this happens
                // every column the cost of exactness buys nothing visible.
                continue;
            }
            if next_pixel == len {
                where_next = s1;
            }

            let samples_per_pixel =
                (where_next - where_now) as f64 / (next_pixel - pixel) as f64;
            let divisor: usize = if samples_per_pixel >= 65536.0 {
                65536
            } else if samples_per_pixel >= 256.0 {
                256
            } else {
                1
            };

            let mut block_status = b as i64;

            // Sample positions (or triple positions) needed from this block
            let start_position = ((src_x - start).max(0) / divisor as SampleCount) as usize;
            let cap = (self.max_samples / divisor).saturating_sub(1) as SampleCount;
            let inclusive_end_position = cap
                .min((next_src_x - 1 - start) / divisor as SampleCount)
                .max(0) as usize;
            let num = 1 + inclusive_end_position as isize - start_position as isize;
            if num <= 0 {
                // A zero-length block should not exist; defend anyway
                debug_assert!(false, "empty block in display walk");
                for p in pixel..next_pixel {
                    min[p] = 0.0;
                    max[p] = 0.0;
                    rms[p] = 0.0;
                    bl[p] = block_status;
                }
                pixel = next_pixel;
                continue;
            }
            let num = num as usize;

            let scan = match divisor {
                1 => {
                    sample_buf.resize(num, 0.0);
                    // Display reads never throw; failures leave zeros
                    let _ = seq_block.file.read(&mut sample_buf[..num], start_position, false);
                    ScanSrc::Samples(&sample_buf[..num])
                }
                256 => {
                    triple_buf.clear();
                    triple_buf.resize(num, MinMaxRms::default());
                    if seq_block.file.summary_available() {
                        seq_block.file.read_256(&mut triple_buf[..num], start_position);
                    } else {
                        block_status = -1 - b as i64;
                    }
                    ScanSrc::Triples(&triple_buf[..num])
                }
                _ => {
                    triple_buf.clear();
                    triple_buf.resize(num, MinMaxRms::default());
                    if seq_block.file.summary_available() {
                        seq_block.file.read_64k(&mut triple_buf[..num], start_position);
                    } else {
                        block_status = -1 - b as i64;
                    }
                    ScanSrc::Triples(&triple_buf[..num])
                }
            };

            let mut file_position = start_position;

            // The previous pixel column may straddle the block boundary; if
            // so, fold the prefix of this block into it. The only write-back
            // to an already-assigned column in this walk.
            if b > block0 && pixel > 0 {
                let mid_position = (((where_now - start) / divisor as SampleCount) as usize)
                    .min(1 + inclusive_end_position);
                if mid_position > file_position {
                    let diff = mid_position - file_position;
                    let values = fold(&scan, 0, diff);

                    let last_pixel = pixel - 1;
                    min[last_pixel] = min[last_pixel].min(values.min);
                    max[last_pixel] = max[last_pixel].max(values.max);

                    let last_num_samples = (last_rms_denom * last_divisor) as f64;
                    let last_rms = rms[last_pixel] as f64;
                    rms[last_pixel] = ((last_rms * last_rms * last_num_samples
                        + values.sumsq as f64 * divisor as f64)
                        / (last_num_samples + diff as f64 * divisor as f64))
                        .sqrt() as f32;

                    file_position = mid_position;
                }
            }

            // Assign whole pixel columns from this block
            let mut rms_denom = 0usize;
            while file_position <= inclusive_end_position {
                // Consecutive columns can share one file position when
                // zoomed close; find the run and the position after it
                let mut pixel_x = pixel + 1;
                let mut position_x = 1 + inclusive_end_position;
                while pixel_x < next_pixel {
                    let p = (((s1 - 1).min(where_[pixel_x]) - start)
                        / divisor as SampleCount) as usize;
                    if file_position == p {
                        pixel_x += 1;
                    } else {
                        position_x = p;
                        break;
                    }
                }
                if pixel_x >= next_pixel {
                    position_x = 1 + inclusive_end_position;
                }
                // Columns can reference positions past the scratch range
                // when a block exceeds the length bound (alias case)
                position_x = position_x.clamp(file_position + 1, 1 + inclusive_end_position);

                rms_denom = position_x - file_position;

                let values = fold(&scan, file_position - start_position, rms_denom);
                let col_rms = (values.sumsq as f64 / rms_denom as f64).sqrt() as f32;
                for p in pixel..pixel_x {
                    min[p] = values.min;
                    max[p] = values.max;
                    rms[p] = col_rms;
                    bl[p] = block_status;
                }

                pixel = pixel_x;
                file_position = position_x;
            }

            debug_assert_eq!(pixel, next_pixel);
            where_now = where_next;
            last_divisor = divisor;
            last_rms_denom = rms_denom;
        }

        debug_assert_eq!(pixel, len);
        true
    }
}
