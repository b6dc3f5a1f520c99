//! G.711 µ-law codec and DTMF tone synthesis.
//!
//! Stateless. Everything here operates on plain byte buffers — no sockets,
//! no locks — so it can be exercised with plain `#[test]`s.

use crate::constants::{
    DEFAULT_GAP_MS, DEFAULT_TONE_MS, DTMF_AMPLITUDE, DTMF_WAIT_SILENCE_MS, FRAME_BYTES,
    MULAW_SILENCE, SAMPLE_RATE_HZ,
};

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// ITU-T keypad row/column frequency pairs, including the `A-D` column used
/// by some PBX/IVR systems beyond the standard 12-key pad.
fn dtmf_frequencies(c: char) -> Option<(f32, f32)> {
    let row = match c {
        '1' | '2' | '3' | 'A' => 697.0,
        '4' | '5' | '6' | 'B' => 770.0,
        '7' | '8' | '9' | 'C' => 852.0,
        '*' | '0' | '#' | 'D' => 941.0,
        _ => return None,
    };
    let col = match c {
        '1' | '4' | '7' | '*' => 1209.0,
        '2' | '5' | '8' | '0' => 1336.0,
        '3' | '6' | '9' | '#' => 1477.0,
        'A' | 'B' | 'C' | 'D' => 1633.0,
        _ => return None,
    };
    Some((row, col))
}

/// Compress one 16-bit linear PCM sample to a µ-law byte, per G.711.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign: i32 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = if sample < 0 {
        -(sample as i32)
    } else {
        sample as i32
    };
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    // Exponent is the position of the highest set bit above the bias range.
    let mut exponent: i32 = 7;
    let mut mask: i32 = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    let byte = sign | (exponent << 4) | mantissa;
    !(byte as u8)
}

fn tone_samples(c: char, duration_ms: u64) -> Vec<i16> {
    let (f1, f2) = match dtmf_frequencies(c.to_ascii_uppercase()) {
        Some(f) => f,
        None => return Vec::new(),
    };
    let sample_count = (SAMPLE_RATE_HZ as u64 * duration_ms / 1000) as usize;
    let mut samples = Vec::with_capacity(sample_count);
    for n in 0..sample_count {
        let t = n as f32 / SAMPLE_RATE_HZ as f32;
        let value = DTMF_AMPLITUDE
            * ((2.0 * std::f32::consts::PI * f1 * t).sin()
                + (2.0 * std::f32::consts::PI * f2 * t).sin());
        samples.push(value.round() as i16);
    }
    samples
}

fn silence_mulaw(duration_ms: u64) -> Vec<u8> {
    let sample_count = (SAMPLE_RATE_HZ as u64 * duration_ms / 1000) as usize;
    vec![MULAW_SILENCE; sample_count]
}

/// Generate ITU dual-tone µ-law audio for a DTMF digit string.
///
/// `0-9`, `*`, `#`, `A-D` (case-insensitive) produce tones of `tone_ms`
/// separated by `gap_ms` of silence (no trailing gap); `W`/`w` produces a
/// fixed 500ms silence; any other character is skipped silently.
pub fn generate_dtmf(digits: &str, tone_ms: Option<u64>, gap_ms: Option<u64>) -> Vec<u8> {
    let tone_ms = tone_ms.unwrap_or(DEFAULT_TONE_MS);
    let gap_ms = gap_ms.unwrap_or(DEFAULT_GAP_MS);
    let mut out = Vec::new();
    let mut emitted_any = false;

    for c in digits.chars() {
        let upper = c.to_ascii_uppercase();
        if upper == 'W' {
            out.extend(silence_mulaw(DTMF_WAIT_SILENCE_MS));
            continue;
        }
        if dtmf_frequencies(upper).is_none() {
            continue;
        }
        if emitted_any {
            out.extend(silence_mulaw(gap_ms));
        }
        for sample in tone_samples(upper, tone_ms) {
            out.push(linear_to_mulaw(sample));
        }
        emitted_any = true;
    }
    out
}

/// Split audio into fixed-size frames, padding the final frame with silence.
pub fn chunk_for_stream(audio: &[u8], frame_bytes: Option<usize>) -> Vec<Vec<u8>> {
    let frame_bytes = frame_bytes.unwrap_or(FRAME_BYTES);
    if frame_bytes == 0 {
        return Vec::new();
    }
    let mut frames = Vec::with_capacity(audio.len().div_ceil(frame_bytes));
    let mut offset = 0;
    while offset < audio.len() {
        let end = (offset + frame_bytes).min(audio.len());
        let mut frame = audio[offset..end].to_vec();
        if frame.len() < frame_bytes {
            frame.resize(frame_bytes, MULAW_SILENCE);
        }
        frames.push(frame);
        offset = end;
    }
    if audio.is_empty() {
        return Vec::new();
    }
    frames
}
