//! Telephony media codec
//!
//! Pure conversions between the wire format (8kHz mono G.711 mu-law) and
//! 16-bit linear PCM, plus resampling between the wire rate and the
//! ASR/TTS native rates. None of these functions fail: byte counts that
//! cannot represent whole samples are fixed by padding, not by errors.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// PCM16 normalization constant for f32 conversion (input direction).
const PCM16_NORMALIZE: f32 = 32768.0;
/// PCM16 scaling constant for f32 conversion (output direction).
const PCM16_SCALE: f32 = 32767.0;

/// Encode a single linear PCM16 sample as a mu-law byte.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    if value > CLIP {
        value = CLIP;
    }
    value += BIAS;

    // Exponent is the position of the highest set bit among bits 7..14.
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && value & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode a single mu-law byte to a linear PCM16 sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = ((b >> 4) & 0x07) as i32;
    let mantissa = (b & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;

    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Decode a mu-law byte stream to little-endian PCM16 bytes.
pub fn mulaw_to_pcm16(mulaw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(mulaw.len() * 2);
    for &b in mulaw {
        out.extend_from_slice(&mulaw_to_linear(b).to_le_bytes());
    }
    out
}

/// Encode little-endian PCM16 bytes as a mu-law byte stream.
///
/// An odd byte count cannot represent whole 16-bit samples; one trailing
/// zero byte is appended before conversion, so the result always holds
/// `(len + 1) / 2` bytes for odd input.
pub fn pcm16_to_mulaw(pcm: &[u8]) -> Vec<u8> {
    let padded;
    let pcm = if pcm.len() % 2 != 0 {
        padded = pad_to_even(pcm);
        padded.as_slice()
    } else {
        pcm
    };

    pcm.chunks_exact(2)
        .map(|c| linear_to_mulaw(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

fn pad_to_even(pcm: &[u8]) -> Vec<u8> {
    let mut padded = Vec::with_capacity(pcm.len() + 1);
    padded.extend_from_slice(pcm);
    padded.push(0);
    padded
}

/// Convert little-endian PCM16 bytes to normalized f32 samples.
pub fn pcm16_to_f32(pcm: &[u8]) -> Vec<f32> {
    let padded;
    let pcm = if pcm.len() % 2 != 0 {
        padded = pad_to_even(pcm);
        padded.as_slice()
    } else {
        pcm
    };

    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / PCM16_NORMALIZE)
        .collect()
}

/// Convert normalized f32 samples back to little-endian PCM16 bytes.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        out.extend_from_slice(&((clamped * PCM16_SCALE) as i16).to_le_bytes());
    }
    out
}

/// Resample little-endian PCM16 bytes between sample rates.
///
/// Uses an FFT-based resampler for buffers long enough to benefit from
/// it and falls back to linear interpolation for very short frames or if
/// the resampler refuses the configuration.
pub fn resample_pcm16(pcm: &[u8], src_hz: u32, dst_hz: u32) -> Vec<u8> {
    if src_hz == dst_hz {
        return pcm.to_vec();
    }

    let samples = pcm16_to_f32(pcm);
    if samples.len() < 64 {
        return f32_to_pcm16(&resample_linear(&samples, src_hz, dst_hz));
    }

    match resample_fft(&samples, src_hz, dst_hz) {
        Ok(resampled) => f32_to_pcm16(&resampled),
        Err(e) => {
            tracing::warn!(error = %e, "FFT resampling failed, using linear fallback");
            f32_to_pcm16(&resample_linear(&samples, src_hz, dst_hz))
        }
    }
}

fn resample_fft(
    samples: &[f32],
    src_hz: u32,
    dst_hz: u32,
) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    use rubato::{FftFixedIn, Resampler};

    let chunk = samples.len().min(1024);
    let mut resampler = FftFixedIn::<f32>::new(src_hz as usize, dst_hz as usize, chunk, 2, 1)?;

    let mut out = Vec::with_capacity(samples.len() * dst_hz as usize / src_hz as usize + 1);
    for block in samples.chunks(chunk) {
        let produced = if block.len() == chunk {
            resampler.process(&[block.to_vec()], None)?
        } else {
            resampler.process_partial(Some(&[block.to_vec()]), None)?
        };
        out.extend_from_slice(&produced[0]);
    }

    // Drain the resampler's internal delay line.
    let none: Option<&[Vec<f32>]> = None;
    let tail = resampler.process_partial(none, None)?;
    out.extend_from_slice(&tail[0]);

    Ok(out)
}

fn resample_linear(samples: &[f32], src_hz: u32, dst_hz: u32) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = dst_hz as f64 / src_hz as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;

    let mut resampled = Vec::with_capacity(new_len);
    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;

        resampled.push(samples[idx_floor] * (1.0 - frac) + samples[idx_ceil] * frac);
    }
    resampled
}

/// Slice a mu-law byte stream into wire frames.
///
/// A 20ms frame at 8kHz is exactly 160 bytes. The trailing frame may be
/// shorter than the nominal size; callers that need exact cadence feed
/// whole multiples.
pub fn mulaw_frames(mulaw: &[u8], frame_ms: u32, rate_hz: u32) -> impl Iterator<Item = &[u8]> {
    let frame_bytes = ((rate_hz as usize * frame_ms as usize) / 1000).max(1);
    mulaw.chunks(frame_bytes)
}

/// Apply a linear fade-in to a PCM16 buffer, preceded by silence.
///
/// Ramps amplitude from 0 to 1 over `duration_ms`, with `start_delay_ms`
/// of leading silence, to avoid clicks at utterance onset.
pub fn apply_fade_in(
    pcm: &[u8],
    sample_rate_hz: u32,
    duration_ms: u32,
    start_delay_ms: u32,
) -> Vec<u8> {
    let padded;
    let pcm = if pcm.len() % 2 != 0 {
        padded = pad_to_even(pcm);
        padded.as_slice()
    } else {
        pcm
    };

    let delay_samples = (sample_rate_hz as usize * start_delay_ms as usize) / 1000;
    let ramp_samples = ((sample_rate_hz as usize * duration_ms as usize) / 1000).max(1);

    let mut out = vec![0u8; delay_samples * 2];
    out.reserve(pcm.len());
    for (i, c) in pcm.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([c[0], c[1]]);
        let sample = if i < ramp_samples {
            ((sample as f32) * (i as f32 / ramp_samples as f32)) as i16
        } else {
            sample
        };
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
