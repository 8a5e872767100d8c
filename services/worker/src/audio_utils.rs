use anyhow::{Context, bail};
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

// Define standard sample rates for clarity and consistency
pub const STT_INPUT_SAMPLE_RATE: u32 = 16000; // Rate the room uplink is pulled at and STT is fed
pub const TTS_OUTPUT_SAMPLE_RATE: u32 = 24000; // Rate requested from TTS and published to the room

const RESAMPLE_CHUNK: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Resamples a whole mono PCM16 buffer from `from` Hz to `to` Hz.
pub fn resample(samples: &[i16], from: u32, to: u32) -> anyhow::Result<Vec<i16>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = create_resampler(from as f64, to as f64, RESAMPLE_CHUNK)?;
    let input = convert_i16_to_f32(samples);
    let expected = (samples.len() as u64 * to as u64).div_ceil(from as u64) as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(delay + expected + RESAMPLE_CHUNK);

    let mut pos = 0;
    while input.len() - pos >= resampler.input_frames_next() {
        let frames = resampler.input_frames_next();
        let wave_in: [&[f32]; 1] = [&input[pos..pos + frames]];
        let chunk = resampler.process(&wave_in[..], None)?;
        output.extend_from_slice(&chunk[0]);
        pos += frames;
    }
    if pos < input.len() {
        let wave_in: [&[f32]; 1] = [&input[pos..]];
        let chunk = resampler.process_partial(Some(&wave_in[..]), None)?;
        output.extend_from_slice(&chunk[0]);
    }
    // Flush the filter delay, then cut the zero padding of the last chunk.
    while output.len() < delay + expected {
        let chunk = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
        if chunk[0].is_empty() {
            break;
        }
        output.extend_from_slice(&chunk[0]);
    }
    output.drain(..delay.min(output.len()));
    output.truncate(expected);

    Ok(convert_f32_to_i16(&output))
}

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Root-mean-square energy of a PCM16 frame, normalized to 0.0..=1.0.
pub fn rms_energy(pcm16: &[i16]) -> f32 {
    if pcm16.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = pcm16
        .iter()
        .map(|&s| {
            let v = s as f32 / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / pcm16.len() as f32).sqrt()
}

/// Wraps mono PCM16 samples in a canonical 44-byte-header WAV container.
pub fn encode_wav(pcm16: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (pcm16.len() * 2) as u32;
    let mut wav = Vec::with_capacity(44 + data_len as usize);

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in pcm16 {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

/// Decoded PCM16 audio, downmixed to mono.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Parses a PCM16 WAV file, walking its chunks. Multi-channel audio is
/// averaged down to mono.
pub fn decode_wav(bytes: &[u8]) -> anyhow::Result<DecodedAudio> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        bail!("Not a RIFF/WAVE file");
    }

    let mut format: Option<(u16, u16, u32, u16)> = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        let body_start = pos + 8;
        // Streaming encoders sometimes write a placeholder size for `data`.
        let body_end = body_start.saturating_add(size).min(bytes.len());
        let body = &bytes[body_start..body_end];

        match id {
            b"fmt " => {
                if body.len() < 16 {
                    bail!("Truncated fmt chunk");
                }
                let audio_format = u16::from_le_bytes([body[0], body[1]]);
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);
                format = Some((audio_format, channels, sample_rate, bits));
            }
            b"data" => {
                let (audio_format, channels, sample_rate, bits) =
                    format.context("WAV data chunk before fmt chunk")?;
                // 0xFFFE is WAVE_FORMAT_EXTENSIBLE, used by some encoders for plain PCM.
                if !(audio_format == 1 || audio_format == 0xFFFE) || bits != 16 {
                    bail!(
                        "Unsupported WAV encoding: format {} with {} bits per sample",
                        audio_format,
                        bits
                    );
                }
                if channels == 0 {
                    bail!("WAV declares zero channels");
                }

                let interleaved: Vec<i16> = body
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect();
                let samples = if channels == 1 {
                    interleaved
                } else {
                    interleaved
                        .chunks_exact(channels as usize)
                        .map(|frame| {
                            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                            (sum / channels as i32) as i16
                        })
                        .collect()
                };
                return Ok(DecodedAudio {
                    samples,
                    sample_rate,
                });
            }
            _ => {}
        }

        // Chunks are word aligned.
        pos = body_start.saturating_add(size + (size & 1));
    }

    bail!("WAV file has no data chunk")
}

/// Decodes a base64 WAV payload, as returned by TTS providers.
pub fn decode_base64_wav(encoded: &str) -> anyhow::Result<DecodedAudio> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .context("TTS audio is not valid base64")?;
    decode_wav(&bytes)
}
