// Copyright 2025-2026 CEMAXECUTER LLC

//! Sample-format codec for interleaved-complex buffers.
//!
//! The radios covered here produce either signed 8-bit I/Q (HackRF) or
//! unsigned 8-bit I/Q (RTL-SDR). Conversions to and from the four client
//! formats work on complex-sample counts; `len` is always complex
//! samples, never components or bytes.

use std::sync::OnceLock;

use num_complex::Complex32;

use crate::SampleFormat;

/// Center offset removed from unsigned 8-bit samples.
const CU8_OFFSET: i16 = 128;

/// Convert native signed 8-bit I/Q into the client format.
pub fn cs8_to_client(fmt: SampleFormat, src: &[u8], dst: &mut [u8], len: usize, iq_swap: bool) {
    debug_assert!(src.len() >= len * 2);
    debug_assert!(dst.len() >= len * fmt.bytes_per_sample());

    for n in 0..len {
        let mut re = src[2 * n] as i8;
        let mut im = src[2 * n + 1] as i8;
        if iq_swap {
            std::mem::swap(&mut re, &mut im);
        }
        write_components(fmt, dst, n, re, im);
    }
}

/// Convert the client format into native signed 8-bit I/Q.
pub fn client_to_cs8(fmt: SampleFormat, src: &[u8], dst: &mut [u8], len: usize, iq_swap: bool) {
    debug_assert!(src.len() >= len * fmt.bytes_per_sample());
    debug_assert!(dst.len() >= len * 2);

    for n in 0..len {
        let (mut re, mut im) = read_components(fmt, src, n);
        if iq_swap {
            std::mem::swap(&mut re, &mut im);
        }
        dst[2 * n] = re as u8;
        dst[2 * n + 1] = im as u8;
    }
}

/// Convert native unsigned 8-bit I/Q (RTL-SDR) into the client format.
///
/// The float and int16 paths go through the 65536-entry lookup tables; the
/// int8 path subtracts the center offset directly.
pub fn cu8_to_client(fmt: SampleFormat, src: &[u8], dst: &mut [u8], len: usize, iq_swap: bool) {
    debug_assert!(src.len() >= len * 2);
    debug_assert!(dst.len() >= len * fmt.bytes_per_sample());

    match fmt {
        SampleFormat::Cs8 => {
            for n in 0..len {
                let mut re = (src[2 * n] as i16 - CU8_OFFSET) as i8;
                let mut im = (src[2 * n + 1] as i16 - CU8_OFFSET) as i8;
                if iq_swap {
                    std::mem::swap(&mut re, &mut im);
                }
                dst[2 * n] = re as u8;
                dst[2 * n + 1] = im as u8;
            }
        }
        SampleFormat::Cs16 => {
            let lut = cu8_lut_i16();
            for n in 0..len {
                let [mut re, mut im] = lut[lut_index(src, n)];
                if iq_swap {
                    std::mem::swap(&mut re, &mut im);
                }
                dst[4 * n..4 * n + 2].copy_from_slice(&re.to_ne_bytes());
                dst[4 * n + 2..4 * n + 4].copy_from_slice(&im.to_ne_bytes());
            }
        }
        SampleFormat::Cf32 => {
            let lut = cu8_lut_f32();
            for n in 0..len {
                let c = lut[lut_index(src, n)];
                let (re, im) = if iq_swap { (c.im, c.re) } else { (c.re, c.im) };
                dst[8 * n..8 * n + 4].copy_from_slice(&re.to_ne_bytes());
                dst[8 * n + 4..8 * n + 8].copy_from_slice(&im.to_ne_bytes());
            }
        }
        SampleFormat::Cf64 => {
            let lut = cu8_lut_f32();
            for n in 0..len {
                let c = lut[lut_index(src, n)];
                let (re, im) = if iq_swap { (c.im, c.re) } else { (c.re, c.im) };
                dst[16 * n..16 * n + 8].copy_from_slice(&(re as f64).to_ne_bytes());
                dst[16 * n + 8..16 * n + 16].copy_from_slice(&(im as f64).to_ne_bytes());
            }
        }
    }
}

#[inline]
fn lut_index(src: &[u8], n: usize) -> usize {
    // (Q << 8) | I
    ((src[2 * n + 1] as usize) << 8) | src[2 * n] as usize
}

fn write_components(fmt: SampleFormat, dst: &mut [u8], n: usize, re: i8, im: i8) {
    match fmt {
        SampleFormat::Cs8 => {
            dst[2 * n] = re as u8;
            dst[2 * n + 1] = im as u8;
        }
        SampleFormat::Cs16 => {
            let re = (re as i16) << 8;
            let im = (im as i16) << 8;
            dst[4 * n..4 * n + 2].copy_from_slice(&re.to_ne_bytes());
            dst[4 * n + 2..4 * n + 4].copy_from_slice(&im.to_ne_bytes());
        }
        SampleFormat::Cf32 => {
            let re = re as f32 / 127.0;
            let im = im as f32 / 127.0;
            dst[8 * n..8 * n + 4].copy_from_slice(&re.to_ne_bytes());
            dst[8 * n + 4..8 * n + 8].copy_from_slice(&im.to_ne_bytes());
        }
        SampleFormat::Cf64 => {
            let re = re as f64 / 127.0;
            let im = im as f64 / 127.0;
            dst[16 * n..16 * n + 8].copy_from_slice(&re.to_ne_bytes());
            dst[16 * n + 8..16 * n + 16].copy_from_slice(&im.to_ne_bytes());
        }
    }
}

fn read_components(fmt: SampleFormat, src: &[u8], n: usize) -> (i8, i8) {
    match fmt {
        SampleFormat::Cs8 => (src[2 * n] as i8, src[2 * n + 1] as i8),
        SampleFormat::Cs16 => {
            let re = i16::from_ne_bytes([src[4 * n], src[4 * n + 1]]);
            let im = i16::from_ne_bytes([src[4 * n + 2], src[4 * n + 3]]);
            ((re >> 8) as i8, (im >> 8) as i8)
        }
        SampleFormat::Cf32 => {
            let re = f32::from_ne_bytes(src[8 * n..8 * n + 4].try_into().unwrap());
            let im = f32::from_ne_bytes(src[8 * n + 4..8 * n + 8].try_into().unwrap());
            (float_to_i8(re as f64), float_to_i8(im as f64))
        }
        SampleFormat::Cf64 => {
            let re = f64::from_ne_bytes(src[16 * n..16 * n + 8].try_into().unwrap());
            let im = f64::from_ne_bytes(src[16 * n + 8..16 * n + 16].try_into().unwrap());
            (float_to_i8(re), float_to_i8(im))
        }
    }
}

/// Scale a unit-range float to int8, rounding half away from zero and
/// clamping to the int8 range.
fn float_to_i8(x: f64) -> i8 {
    (x * 127.0).round().clamp(-128.0, 127.0) as i8
}

static CU8_LUT_F32: OnceLock<Vec<Complex32>> = OnceLock::new();
static CU8_LUT_I16: OnceLock<Vec<[i16; 2]>> = OnceLock::new();

/// Unsigned-8-bit to float lookup table, indexed by `(Q << 8) | I`.
/// Built once per process.
fn cu8_lut_f32() -> &'static [Complex32] {
    CU8_LUT_F32.get_or_init(|| {
        (0..0x10000usize)
            .map(|word| {
                let i = (word & 0xff) as f32;
                let q = (word >> 8) as f32;
                Complex32::new((i - 127.4) / 128.0, (q - 127.4) / 128.0)
            })
            .collect()
    })
}

/// Int16-scaled variant of the unsigned-8-bit lookup table.
fn cu8_lut_i16() -> &'static [[i16; 2]] {
    CU8_LUT_I16.get_or_init(|| {
        (0..0x10000usize)
            .map(|word| {
                let i = (word & 0xff) as f32;
                let q = (word >> 8) as f32;
                let re = ((i - 127.4) / 128.0 * 32767.0).round() as i16;
                let im = ((q - 127.4) / 128.0 * 32767.0).round() as i16;
                [re, im]
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs8_frame(samples: &[(i8, i8)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(re, im) in samples {
            out.push(re as u8);
            out.push(im as u8);
        }
        out
    }

    #[test]
    fn test_cs8_identity() {
        let src = cs8_frame(&[(1, -2), (127, -128), (0, 5)]);
        let mut dst = vec![0u8; src.len()];
        cs8_to_client(SampleFormat::Cs8, &src, &mut dst, 3, false);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_cs8_iq_swap() {
        let src = cs8_frame(&[(1, -2)]);
        let mut dst = vec![0u8; 2];
        cs8_to_client(SampleFormat::Cs8, &src, &mut dst, 1, true);
        assert_eq!(dst, cs8_frame(&[(-2, 1)]));
    }

    #[test]
    fn test_cs8_to_cs16_shift() {
        let src = cs8_frame(&[(1, -1)]);
        let mut dst = vec![0u8; 4];
        cs8_to_client(SampleFormat::Cs16, &src, &mut dst, 1, false);
        let re = i16::from_ne_bytes([dst[0], dst[1]]);
        let im = i16::from_ne_bytes([dst[2], dst[3]]);
        assert_eq!(re, 256);
        assert_eq!(im, -256);
    }

    #[test]
    fn test_roundtrip_through_wider_formats() {
        // i8 -> {i16, f32, f64} -> i8 must be lossless.
        let samples: Vec<(i8, i8)> = (-128..=127).map(|v| (v as i8, (-v) as i8)).collect();
        let src = cs8_frame(&samples);
        for fmt in [SampleFormat::Cs16, SampleFormat::Cf32, SampleFormat::Cf64] {
            let mut mid = vec![0u8; samples.len() * fmt.bytes_per_sample()];
            let mut back = vec![0u8; src.len()];
            cs8_to_client(fmt, &src, &mut mid, samples.len(), false);
            client_to_cs8(fmt, &mid, &mut back, samples.len(), false);
            assert_eq!(back, src, "roundtrip failed via {:?}", fmt);
        }
    }

    #[test]
    fn test_float_to_i8_rounding() {
        // Half away from zero, clamped to the int8 range.
        assert_eq!(float_to_i8(0.5 / 127.0), 1);
        assert_eq!(float_to_i8(-0.5 / 127.0), -1);
        assert_eq!(float_to_i8(1.5), 127);
        assert_eq!(float_to_i8(-1.5), -128);
    }

    #[test]
    fn test_cu8_to_cs8_offset() {
        let src = vec![128u8, 0, 255, 130];
        let mut dst = vec![0u8; 4];
        cu8_to_client(SampleFormat::Cs8, &src, &mut dst, 2, false);
        assert_eq!(dst[0] as i8, 0);
        assert_eq!(dst[1] as i8, -128);
        assert_eq!(dst[2] as i8, 127);
        assert_eq!(dst[3] as i8, 2);
    }

    #[test]
    fn test_cu8_lut_values() {
        let lut = cu8_lut_f32();
        // Index (Q=0, I=0): both components at the bottom of the range.
        let c = lut[0];
        assert!((c.re - (0.0 - 127.4) / 128.0).abs() < 1e-6);
        assert!((c.im - (0.0 - 127.4) / 128.0).abs() < 1e-6);
        // Index (Q=255, I=128).
        let c = lut[(255 << 8) | 128];
        assert!((c.re - (128.0 - 127.4) / 128.0).abs() < 1e-6);
        assert!((c.im - (255.0 - 127.4) / 128.0).abs() < 1e-6);
        assert_eq!(lut.len(), 0x10000);
    }

    #[test]
    fn test_cu8_to_cf32_uses_lut() {
        let src = vec![200u8, 100];
        let mut dst = vec![0u8; 8];
        cu8_to_client(SampleFormat::Cf32, &src, &mut dst, 1, false);
        let re = f32::from_ne_bytes(dst[0..4].try_into().unwrap());
        let im = f32::from_ne_bytes(dst[4..8].try_into().unwrap());
        assert!((re - (200.0 - 127.4) / 128.0).abs() < 1e-6);
        assert!((im - (100.0 - 127.4) / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_cu8_to_cs16_scaled() {
        let src = vec![255u8, 0];
        let mut dst = vec![0u8; 4];
        cu8_to_client(SampleFormat::Cs16, &src, &mut dst, 1, false);
        let re = i16::from_ne_bytes([dst[0], dst[1]]);
        let im = i16::from_ne_bytes([dst[2], dst[3]]);
        assert_eq!(re, ((255.0f32 - 127.4) / 128.0 * 32767.0).round() as i16);
        assert_eq!(im, ((0.0f32 - 127.4) / 128.0 * 32767.0).round() as i16);
    }
}
