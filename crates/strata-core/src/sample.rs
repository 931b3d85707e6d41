//! Sample types and storage-format conversion

use serde::{Deserialize, Serialize};

/// Type alias for in-memory audio samples (always f32; storage formats
/// quantize at the block-file boundary)
pub type Sample = f32;

/// On-disk sample encoding of a sequence's block files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum SampleFormat {
    Int16 = 0,
    Int24 = 1,
    Float = 2,
}

impl SampleFormat {
    /// Bytes per stored sample (24-bit samples occupy four bytes)
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int24 => 4,
            Self::Float => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::Int24 => "int24",
            Self::Float => "float",
        }
    }

    /// Validated decode of the persisted `sampleformat` attribute
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Int16),
            1 => Some(Self::Int24),
            2 => Some(Self::Float),
            _ => None,
        }
    }

    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::Float
    }
}

const INT16_SCALE: f32 = 32767.0;
const INT24_SCALE: f32 = 8388607.0;

/// Append the storage encoding of `samples` to `out`, little-endian
pub fn encode_samples(samples: &[Sample], format: SampleFormat, out: &mut Vec<u8>) {
    out.reserve(samples.len() * format.bytes());
    match format {
        SampleFormat::Int16 => {
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) * INT16_SCALE) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::Int24 => {
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) * INT24_SCALE) as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::Float => {
            for &s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
    }
}

/// Decode stored bytes back into f32 samples. `bytes` must hold exactly
/// `out.len()` samples in `format`'s encoding.
pub fn decode_samples(bytes: &[u8], format: SampleFormat, out: &mut [Sample]) {
    debug_assert_eq!(bytes.len(), out.len() * format.bytes());
    match format {
        SampleFormat::Int16 => {
            for (chunk, dst) in bytes.chunks_exact(2).zip(out.iter_mut()) {
                let v = i16::from_le_bytes([chunk[0], chunk[1]]);
                *dst = v as f32 / INT16_SCALE;
            }
        }
        SampleFormat::Int24 => {
            for (chunk, dst) in bytes.chunks_exact(4).zip(out.iter_mut()) {
                let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                *dst = v as f32 / INT24_SCALE;
            }
        }
        SampleFormat::Float => {
            for (chunk, dst) in bytes.chunks_exact(4).zip(out.iter_mut()) {
                *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(SampleFormat::Int16.bytes(), 2);
        assert_eq!(SampleFormat::Int24.bytes(), 4);
        assert_eq!(SampleFormat::Float.bytes(), 4);
    }

    #[test]
    fn test_format_code_roundtrip() {
        for fmt in [SampleFormat::Int16, SampleFormat::Int24, SampleFormat::Float] {
            assert_eq!(SampleFormat::from_code(fmt.code() as i64), Some(fmt));
        }
        assert_eq!(SampleFormat::from_code(3), None);
        assert_eq!(SampleFormat::from_code(-1), None);
    }

    #[test]
    fn test_int16_roundtrip_error_bound() {
        let samples: Vec<Sample> = (0..1000)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / 100.0).sin())
            .collect();

        let mut bytes = Vec::new();
        encode_samples(&samples, SampleFormat::Int16, &mut bytes);
        let mut decoded = vec![0.0; samples.len()];
        decode_samples(&bytes, SampleFormat::Int16, &mut decoded);

        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1.0 / 32767.0 + 1e-6);
        }
    }

    #[test]
    fn test_float_roundtrip_exact() {
        let samples = vec![0.5, -0.25, 1.5, -2.0, 0.0];
        let mut bytes = Vec::new();
        encode_samples(&samples, SampleFormat::Float, &mut bytes);
        let mut decoded = vec![0.0; samples.len()];
        decode_samples(&bytes, SampleFormat::Float, &mut decoded);
        assert_eq!(samples, decoded);
    }

    #[test]
    fn test_int24_roundtrip_error_bound() {
        let samples: Vec<Sample> = (0..100).map(|i| (i as f32 * 0.31).sin()).collect();
        let mut bytes = Vec::new();
        encode_samples(&samples, SampleFormat::Int24, &mut bytes);
        let mut decoded = vec![0.0; samples.len()];
        decode_samples(&bytes, SampleFormat::Int24, &mut decoded);
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 1.0 / 8388607.0 + 1e-7);
        }
    }

    #[test]
    fn test_integer_encode_clamps() {
        let mut bytes = Vec::new();
        encode_samples(&[2.0, -2.0], SampleFormat::Int16, &mut bytes);
        let mut decoded = [0.0; 2];
        decode_samples(&bytes, SampleFormat::Int16, &mut decoded);
        assert_eq!(decoded[0], 1.0);
        assert_eq!(decoded[1], -1.0);
    }
}
