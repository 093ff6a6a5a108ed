//! Audio codec: μ-law (G.711) ↔ PCM16, 8 kHz ↔ 16 kHz upsampling, WAV framing.
//!
//! Pure, stateless byte-buffer conversions. No network or session state here —
//! every function is a straight transform so it can be unit-tested without a
//! running pipeline.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// μ-law decode exponent table, ITU-T G.711.
const EXP_LUT: [i16; 8] = [0, 132, 396, 924, 1980, 4092, 8316, 16764];

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Decode a single μ-law byte to a 16-bit linear PCM sample.
pub fn mulaw_decode_sample(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i16;
    let sample = EXP_LUT[exponent as usize] + (mantissa << (exponent + 3));
    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// Encode a single 16-bit linear PCM sample to μ-law.
///
/// Segment is found by scanning for the highest set bit of the biased
/// magnitude, not by `log2`. A `log(x)/log(2) - 5` shortcut looks equivalent
/// but rounds wrong near segment boundaries and flips the sign bit for a
/// large fraction of inputs — the table-scan below is the correct approach.
pub fn mulaw_encode_sample(pcm: i16) -> u8 {
    const SEG_END: [i32; 8] = [0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF, 0x3FFF, 0x7FFF];

    let mut sign: u8 = 0x80;
    let mut sample = pcm as i32;
    if sample < 0 {
        sample = -sample;
        sign = 0x00;
    }
    if sample > CLIP {
        sample = CLIP;
    }
    sample += BIAS;

    let seg = SEG_END
        .iter()
        .position(|&end| sample <= end)
        .unwrap_or(7) as u32;

    let mantissa = ((sample >> (seg + 3)) & 0x0F) as u8;
    !(sign | ((seg as u8) << 4) | mantissa)
}

/// Decode a buffer of 8 kHz μ-law bytes into 16 kHz PCM16 samples.
///
/// Upsampling emits each decoded sample followed by the arithmetic mean of it
/// and its successor; the final sample has no successor so it is duplicated.
pub fn mulaw_to_pcm16_16k(mulaw: &[u8]) -> Vec<i16> {
    if mulaw.is_empty() {
        return Vec::new();
    }
    let decoded: Vec<i16> = mulaw.iter().map(|&b| mulaw_decode_sample(b)).collect();
    let mut out = Vec::with_capacity(decoded.len() * 2);
    for i in 0..decoded.len() {
        out.push(decoded[i]);
        if i + 1 < decoded.len() {
            let mean = (decoded[i] as i32 + decoded[i + 1] as i32) / 2;
            out.push(mean as i16);
        } else {
            out.push(decoded[i]);
        }
    }
    out
}

/// Encode 8 kHz PCM16 samples to μ-law bytes. Callers must not pass 16 kHz
/// audio here — the GPU service resamples TTS output to 8 kHz before
/// streaming it back, this function never decimates.
pub fn pcm16_to_mulaw(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| mulaw_encode_sample(s)).collect()
}

/// true iff every sample's magnitude is at most 20.
pub fn is_silence(pcm: &[i16]) -> bool {
    pcm.iter().all(|&s| s.unsigned_abs() <= 20)
}

/// Build a canonical 44-byte RIFF/WAVE header followed by raw PCM16 data,
/// base64-encoded for transport to the GPU inference service.
pub fn pcm16_to_wav_base64(pcm: &[i16], sample_rate: u32) -> String {
    let data_len = pcm.len() * 2;
    let mut buf = Vec::with_capacity(44 + data_len);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * 2; // mono, 16-bit
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_len as u32).to_le_bytes());
    for sample in pcm {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    BASE64.encode(&buf)
}

/// Decode a base64 WAV payload to PCM16 samples.
///
/// If the RIFF magic is present, walk the chunk list (respecting even-byte
/// padding) to find the `data` chunk rather than assuming offset 44 — senders
/// pad `fmt ` chunks with extension fields often enough that the fixed offset
/// is unsafe. If RIFF is absent, treat the whole payload as raw PCM16.
pub fn wav_base64_to_pcm16(b64: &str) -> anyhow::Result<Vec<i16>> {
    let bytes = BASE64.decode(b64.trim())?;
    Ok(wav_bytes_to_pcm16(&bytes))
}

pub fn wav_bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    let data = find_data_chunk(bytes).unwrap_or(bytes);
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn find_data_chunk(bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_len = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        let body_start = pos + 8;
        let body_end = (body_start + chunk_len).min(bytes.len());
        if chunk_id == b"data" {
            return Some(&bytes[body_start..body_end]);
        }
        // chunks are padded to an even number of bytes
        let padded_len = chunk_len + (chunk_len % 2);
        pos = body_start + padded_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_preserves_sign_and_bounds_error() {
        for pcm in (-32635i32..=32635).step_by(97) {
            let pcm = pcm as i16;
            let encoded = mulaw_encode_sample(pcm);
            let decoded = mulaw_decode_sample(encoded);
            if pcm != 0 {
                assert_eq!(pcm.signum(), decoded.signum(), "sign flipped for {pcm}");
            }
            let err = (pcm as i32 - decoded as i32).unsigned_abs() as f64;
            let magnitude = (pcm.unsigned_abs() as f64).max(1.0);
            assert!(
                err / magnitude <= 0.023,
                "quantization error {err} too large for sample {pcm}"
            );
        }
    }

    #[test]
    fn upsample_duplicates_last_sample_and_averages_the_rest() {
        // three decoded samples worth of mu-law input
        let mulaw = [mulaw_encode_sample(100), mulaw_encode_sample(200), mulaw_encode_sample(300)];
        let up = mulaw_to_pcm16_16k(&mulaw);
        assert_eq!(up.len(), 6);
        // last original sample is duplicated
        assert_eq!(up[4], up[5]);
    }

    #[test]
    fn is_silence_detects_near_zero_buffers() {
        assert!(is_silence(&[0, 5, -10, 20, -20]));
        assert!(!is_silence(&[0, 5, 21]));
        assert!(is_silence(&[]));
    }

    #[test]
    fn wav_round_trip_finds_data_chunk_at_canonical_offset() {
        let pcm = vec![1i16, -2, 3, -4, 32000, -32000];
        let b64 = pcm16_to_wav_base64(&pcm, 16000);
        let decoded = wav_base64_to_pcm16(&b64).unwrap();
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn wav_decode_falls_back_to_raw_bytes_without_riff_magic() {
        let pcm = vec![7i16, -7, 1234];
        let mut raw = Vec::new();
        for s in &pcm {
            raw.extend_from_slice(&s.to_le_bytes());
        }
        let decoded = wav_bytes_to_pcm16(&raw);
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn wav_decode_skips_padded_extension_chunk_before_data() {
        // fmt chunk with a 1-byte odd-length extension before an even-padding byte,
        // then a LIST chunk, then data - exercises the chunk walk, not offset 44.
        let pcm = vec![42i16, -42];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"RIFF");
        buf.extend_from_slice(&0u32.to_le_bytes()); // size placeholder, unused by decoder
        buf.extend_from_slice(b"WAVE");
        buf.extend_from_slice(b"LIST");
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3, 0]); // 3 bytes + 1 pad byte
        buf.extend_from_slice(b"data");
        buf.extend_from_slice(&((pcm.len() * 2) as u32).to_le_bytes());
        for s in &pcm {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        let decoded = wav_bytes_to_pcm16(&buf);
        assert_eq!(decoded, pcm);
    }
}
