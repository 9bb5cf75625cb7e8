//! Software volume applied to interleaved little-endian PCM bytes

use crate::audio::native::SampleFormat;

/// Scale every sample in `bytes` by `gain`, saturating integer formats.
///
/// A trailing partial sample is left untouched.
pub fn apply_gain(bytes: &mut [u8], format: SampleFormat, gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }

    match format {
        SampleFormat::Int8 => {
            for b in bytes.iter_mut() {
                let s = *b as i8 as f32 * gain;
                *b = s.clamp(i8::MIN as f32, i8::MAX as f32) as i8 as u8;
            }
        }
        SampleFormat::Int16 => {
            for s in bytes.chunks_exact_mut(2) {
                let v = i16::from_le_bytes([s[0], s[1]]) as f32 * gain;
                let v = v.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                s.copy_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::Int24 => {
            const MAX: f32 = 8_388_607.0;
            const MIN: f32 = -8_388_608.0;
            for s in bytes.chunks_exact_mut(3) {
                // sign-extend through the top byte of an i32
                let v = i32::from_le_bytes([0, s[0], s[1], s[2]]) >> 8;
                let v = (v as f32 * gain).clamp(MIN, MAX) as i32;
                let le = v.to_le_bytes();
                s.copy_from_slice(&le[..3]);
            }
        }
        SampleFormat::Int32 => {
            for s in bytes.chunks_exact_mut(4) {
                let v = i32::from_le_bytes([s[0], s[1], s[2], s[3]]) as f64 * gain as f64;
                let v = v.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
                s.copy_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::Float32 => {
            for s in bytes.chunks_exact_mut(4) {
                let v = f32::from_le_bytes([s[0], s[1], s[2], s[3]]) * gain;
                s.copy_from_slice(&v.to_le_bytes());
            }
        }
    }
}
