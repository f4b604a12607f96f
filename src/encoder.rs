//! Answer encoding
//!
//! Normalizes whatever the capture device produced into the transcription
//! service's on-wire contract: a WAV container holding mono, 16-bit signed
//! PCM at 16 kHz. The container exists so the server never has to handle
//! arbitrary source formats. If encoding fails for any reason the raw
//! captured bytes are submitted instead of losing the answer.

use crate::capture::CaptureBuffer;
use crate::error::{Result, SessionError};
use std::io::Cursor;
use tracing::{debug, error};

/// Sample rate of the transcription contract.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;
/// The backend hard-caps transcription input at 58 s; anything longer that
/// slips past the recording ceiling is truncated here.
pub const MAX_ENCODED_SECS: u32 = 58;

/// Container format of an encoded answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerFormat {
    /// WAV, mono, 16-bit, 16 kHz: the normal case.
    Wav,
    /// Raw little-endian PCM at the capture spec: the encoding-failure
    /// fallback.
    RawPcm,
}

/// An encoded answer, immutable once produced, consumed exactly once by the
/// transmission call.
#[derive(Debug, Clone)]
pub struct EncodedAnswer {
    pub bytes: Vec<u8>,
    pub format: AnswerFormat,
}

impl EncodedAnswer {
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn file_name(&self) -> &'static str {
        match self.format {
            AnswerFormat::Wav => "answer.wav",
            AnswerFormat::RawPcm => "answer.pcm",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self.format {
            AnswerFormat::Wav => "audio/wav",
            AnswerFormat::RawPcm => "application/octet-stream",
        }
    }
}

/// Finalize a capture buffer into an `EncodedAnswer`. Consumes the buffer;
/// there is no second encode for a recording.
pub fn encode_answer(buffer: CaptureBuffer) -> EncodedAnswer {
    let spec = buffer.spec;
    match encode_wav(&buffer) {
        Ok(bytes) => {
            debug!(
                "encoded answer: {} bytes WAV from {} Hz x{} capture",
                bytes.len(),
                spec.sample_rate,
                spec.channels
            );
            EncodedAnswer {
                bytes,
                format: AnswerFormat::Wav,
            }
        }
        Err(e) => {
            // Losing the answer is worse than shipping an unnormalized blob.
            error!("answer encoding failed, submitting raw capture: {}", e);
            EncodedAnswer {
                bytes: raw_bytes(&buffer.samples),
                format: AnswerFormat::RawPcm,
            }
        }
    }
}

fn encode_wav(buffer: &CaptureBuffer) -> Result<Vec<u8>> {
    let spec = buffer.spec;
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(SessionError::EncodingFailure(format!(
            "invalid capture spec: {} Hz x{}",
            spec.sample_rate, spec.channels
        )));
    }

    let mono = downmix(&buffer.samples, spec.channels);
    let resampled = resample_linear(&mono, spec.sample_rate, TARGET_SAMPLE_RATE);
    let mut pcm = quantize(&resampled);

    let max_samples = (TARGET_SAMPLE_RATE * MAX_ENCODED_SECS) as usize;
    if pcm.len() > max_samples {
        pcm.truncate(max_samples);
    }

    write_wav(&pcm)
}

/// Average interleaved channels down to one, normalized to f32 in [-1, 1].
fn downmix(samples: &[i16], channels: u16) -> Vec<f32> {
    let channels = channels as usize;
    if channels <= 1 {
        return samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| s as f32).sum();
            sum / channels as f32 / i16::MAX as f32
        })
        .collect()
}

/// Linear-interpolation resampler.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16)
        .collect()
}

fn write_wav(pcm: &[i16]) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TARGET_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| SessionError::EncodingFailure(e.to_string()))?;
        for &s in pcm {
            writer
                .write_sample(s)
                .map_err(|e| SessionError::EncodingFailure(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| SessionError::EncodingFailure(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

fn raw_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}
